//! End-to-end coverage of the six concrete scenarios, exercised through
//! `Provider`/`Instance` rather than raw SQL, against fresh in-memory
//! databases.

use std::io::Write;
use std::sync::{Arc, Mutex};

use cache_common::{Metrics, StorageErrorIntrospect};
use cache_settings::{ConstructionOptions, ProviderOptions};
use cache_sqlite::{Provider, Resource};

async fn provider_with(num_conns: u32, batch_writes: bool) -> Provider {
    let construction = ConstructionOptions {
        path: None,
        memory: true,
        num_conns,
        concurrent_blob_reads: false,
        dont_init_schema: false,
        capacity: 0,
    };
    let provider_opts = ProviderOptions {
        num_conns,
        concurrent_blob_read: false,
        batch_writes,
    };
    Provider::new(&construction, &provider_opts, Metrics::noop())
        .await
        .expect("provider construction")
}

#[tokio::test]
async fn scenario_1_eviction_order() {
    let provider = provider_with(1, false).await;
    provider.set_capacity(10).await.unwrap();

    provider.new_instance("a").put(vec![1, 2, 3]).await.unwrap();
    provider
        .new_instance("b")
        .put(vec![4, 5, 6, 7])
        .await
        .unwrap();
    provider
        .new_instance("c")
        .put(vec![8, 9, 10])
        .await
        .unwrap();

    // At exactly capacity (10), nothing is evicted yet.
    assert_eq!(provider.new_instance("a").stat().await.unwrap().size, 3);

    provider.new_instance("d").put(vec![11, 12]).await.unwrap();

    assert!(provider.new_instance("a").stat().await.is_err());
    assert_eq!(provider.new_instance("b").stat().await.unwrap().size, 4);
    assert_eq!(provider.new_instance("c").stat().await.unwrap().size, 3);
    assert_eq!(provider.new_instance("d").stat().await.unwrap().size, 2);
}

#[tokio::test]
async fn scenario_2_single_oversized_blob() {
    let provider = provider_with(1, false).await;
    provider.set_capacity(5).await.unwrap();

    let x = provider.new_instance("x");
    x.put(vec![1, 2, 3, 4, 5, 6, 7]).await.unwrap();

    assert_eq!(x.stat().await.unwrap().size, 7);
}

#[tokio::test]
async fn scenario_3_replace_accounting() {
    let provider = provider_with(1, false).await;
    let k = provider.new_instance("k");

    k.put(vec![0, 0]).await.unwrap();
    assert_eq!(k.stat().await.unwrap().size, 2);

    k.put(vec![0, 0, 0, 0, 0]).await.unwrap();
    assert_eq!(k.stat().await.unwrap().size, 5);
}

/// A `Write` sink that hands its bytes to a shared buffer, so a test can
/// both move the sink into `write_consecutive_chunks` and inspect what
/// landed in it afterward.
#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn scenario_4_consecutive_chunks() {
    let provider = provider_with(1, false).await;
    provider
        .new_instance("piece/0")
        .put(b"aa".to_vec())
        .await
        .unwrap();
    provider
        .new_instance("piece/2")
        .put(b"cc".to_vec())
        .await
        .unwrap();
    provider
        .new_instance("piece/1")
        .put(b"bb".to_vec())
        .await
        .unwrap();

    let shared = Arc::new(Mutex::new(Vec::new()));
    let (written, result) = provider
        .write_consecutive_chunks("piece/", SharedBuf(Arc::clone(&shared)))
        .await;
    result.unwrap();
    assert_eq!(written, 6);
    assert_eq!(&*shared.lock().unwrap(), b"aabbcc");
}

#[tokio::test]
async fn scenario_5_batching_throughput() {
    let provider = provider_with(4, true).await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            provider
                .new_instance(format!("k{i}"))
                .put(vec![0u8; 8])
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for i in 0..100 {
        assert_eq!(
            provider.new_instance(format!("k{i}")).stat().await.unwrap().size,
            8
        );
    }
}

#[tokio::test]
async fn scenario_6_read_at_bounds() {
    let provider = provider_with(1, false).await;
    let inst = provider.new_instance("blob");
    inst.put(vec![b'a', b'b', b'c', b'd']).await.unwrap();

    let mut buf = [0u8; 2];
    let read = inst.read_at(&mut buf, 3).await;
    assert_eq!(read.n, 1);
    assert!(read.result.as_ref().unwrap_err().is_eof());
    assert_eq!(&buf[..read.n], b"d");
}

#[tokio::test]
async fn get_updates_last_used_stat_and_read_at_do_not() {
    let provider = provider_with(1, false).await;
    let inst = provider.new_instance("blob");
    inst.put(b"hello".to_vec()).await.unwrap();

    let mut reader = inst.get().await.unwrap();
    assert_eq!(reader.size(), 5);
    let mut buf = [0u8; 5];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");
    reader.close();

    let mut range = [0u8; 2];
    let _ = inst.read_at(&mut range, 0).await;
    let _ = inst.stat().await.unwrap();
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let provider = provider_with(1, false).await;
    let inst = provider.new_instance("blob");
    inst.put(b"hello".to_vec()).await.unwrap();
    inst.delete().await.unwrap();

    assert!(inst.get().await.unwrap_err().is_not_found());
    assert!(inst.stat().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn readdir_names_strips_prefix() {
    let provider = provider_with(1, false).await;
    provider
        .new_instance("dir/a")
        .put(b"1".to_vec())
        .await
        .unwrap();
    provider
        .new_instance("dir/b")
        .put(b"2".to_vec())
        .await
        .unwrap();
    provider
        .new_instance("other/c")
        .put(b"3".to_vec())
        .await
        .unwrap();

    let mut names = provider.new_instance("dir").readdir_names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
}

#[tokio::test]
#[should_panic(expected = "write_at is not supported")]
async fn write_at_panics() {
    let provider = provider_with(1, false).await;
    let inst = provider.new_instance("blob");
    inst.write_at(b"x", 0);
}

#[tokio::test]
async fn close_then_reject_further_writes() {
    let provider = provider_with(1, true).await;
    provider.new_instance("a").put(b"x".to_vec()).await.unwrap();
    provider.close().await.unwrap();

    let result = provider.new_instance("a").put(b"y".to_vec()).await;
    assert!(result.is_err());
}
