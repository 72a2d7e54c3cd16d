//! Tensor Reader (spec §4.3): assembles a contiguous byte view of a
//! tensor from its `TensorLocation`, reading shard bytes through the
//! Shard Cache. Zero-copy for single-shard tensors, concatenated for
//! multi-span tensors. Pure with respect to GPU state.

use bytes::{Bytes, BytesMut};

use crate::error::{LoaderError, LoaderResult};
use crate::manifest::TensorLocation;
use crate::shard_cache::{Priority, ShardCache};

/// Read the tensor's bytes, bounds-checking every span against the shard
/// it names.
pub async fn read_tensor(
    cache: &ShardCache,
    location: &TensorLocation,
    priority: Priority,
) -> LoaderResult<Bytes> {
    if location.is_multi_span() {
        return read_multi_span(cache, location, priority).await;
    }
    let shard_index = location.shard_index.ok_or_else(|| {
        LoaderError::TensorNotFound("tensor location has neither shard nor spans".into())
    })?;
    let shard = cache.load(shard_index, priority).await?;
    bounds_checked_slice(&shard, shard_index, location.offset, location.size)
}

async fn read_multi_span(
    cache: &ShardCache,
    location: &TensorLocation,
    priority: Priority,
) -> LoaderResult<Bytes> {
    let spans = location
        .spans
        .as_ref()
        .expect("is_multi_span guarantees spans is Some and non-empty");
    let mut out = BytesMut::with_capacity(location.size as usize);
    for span in spans {
        let shard = cache.load(span.shard_index, priority).await?;
        let slice = bounds_checked_slice(&shard, span.shard_index, span.offset, span.size)?;
        out.extend_from_slice(&slice);
    }
    if out.len() as u64 != location.size {
        return Err(LoaderError::ShardTooSmall {
            shard: spans[0].shard_index,
            needed: location.size as usize,
            have: out.len(),
        });
    }
    Ok(out.freeze())
}

fn bounds_checked_slice(shard: &Bytes, shard_index: usize, offset: u64, size: u64) -> LoaderResult<Bytes> {
    let offset = offset as usize;
    let end = offset + size as usize;
    if end > shard.len() {
        return Err(LoaderError::ShardTooSmall {
            shard: shard_index,
            needed: end,
            have: shard.len(),
        });
    }
    Ok(shard.slice(offset..end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Dtype, TensorRole};
    use crate::manifest::Span;
    use crate::storage::InMemoryStorageBackend;
    use std::sync::Arc;

    fn single_shard_location(offset: u64, size: u64) -> TensorLocation {
        TensorLocation {
            shard_index: Some(0),
            spans: None,
            offset,
            size,
            shape: vec![size as usize],
            dtype: Dtype::F32,
            role: TensorRole::Other,
            group: None,
            layout: None,
            original_shape: None,
        }
    }

    #[tokio::test]
    async fn single_shard_slice_is_exact() {
        let backend = Arc::new(InMemoryStorageBackend::new().with_shard(0, Bytes::from_static(b"0123456789")));
        let cache = ShardCache::new(backend, 4).with_verify_hashes(false);
        let location = single_shard_location(2, 5);
        let bytes = read_tensor(&cache, &location, Priority::High).await.unwrap();
        assert_eq!(&bytes[..], b"23456");
    }

    #[tokio::test]
    async fn single_shard_out_of_bounds_errors() {
        let backend = Arc::new(InMemoryStorageBackend::new().with_shard(0, Bytes::from_static(b"01234")));
        let cache = ShardCache::new(backend, 4).with_verify_hashes(false);
        let location = single_shard_location(2, 10);
        let err = read_tensor(&cache, &location, Priority::High).await.unwrap_err();
        assert!(matches!(err, LoaderError::ShardTooSmall { .. }));
    }

    #[tokio::test]
    async fn multi_span_concatenates_in_order() {
        let backend = Arc::new(
            InMemoryStorageBackend::new()
                .with_shard(0, Bytes::from_static(b"xxxxxxxxxxaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"))
                .with_shard(1, Bytes::from_static(b"bb")),
        );
        let cache = ShardCache::new(backend, 4).with_verify_hashes(false);
        let location = TensorLocation {
            shard_index: None,
            spans: Some(vec![
                Span { shard_index: 0, offset: 10, size: 3 },
                Span { shard_index: 1, offset: 0, size: 2 },
            ]),
            offset: 0,
            size: 5,
            shape: vec![5],
            dtype: Dtype::F32,
            role: TensorRole::Other,
            group: None,
            layout: None,
            original_shape: None,
        };
        let bytes = read_tensor(&cache, &location, Priority::High).await.unwrap();
        assert_eq!(&bytes[..], b"aaabb");
    }
}
