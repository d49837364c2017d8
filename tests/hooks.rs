//! Shutdown hook ordering and error collection.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use graceful_router::lifecycle::BoxError;
use graceful_router::{Error, Graceful, Listener, Phase, ShutdownContext};
use tokio::net::TcpStream;

use common::*;

#[tokio::test]
async fn test_hook_order_around_server_shutdown() {
    let addr = free_addr();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut builder = Graceful::builder(example_router()).listener(Listener::addr(addr.to_string()));
    for name in ["before0", "before1"] {
        let log = log.clone();
        builder = builder.before_shutdown(name, move |_ctx| {
            let log = log.clone();
            async move {
                let serving = TcpStream::connect(addr).await.is_ok();
                log.lock().unwrap().push(format!("{name}:{serving}"));
                Ok::<_, BoxError>(())
            }
        });
    }
    for name in ["after0", "after1"] {
        let log = log.clone();
        builder = builder.after_shutdown(name, move |_ctx| {
            let log = log.clone();
            async move {
                let serving = TcpStream::connect(addr).await.is_ok();
                log.lock().unwrap().push(format!("{name}:{serving}"));
                Ok::<_, BoxError>(())
            }
        });
    }
    let graceful = builder.build().unwrap();

    graceful.start().unwrap();
    wait_for_listener(addr).await;
    graceful.shutdown(&ShutdownContext::background()).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["before0:true", "before1:true", "after0:false", "after1:false"]
    );

    graceful.stop().await.unwrap();
    graceful.close().await;
}

#[tokio::test]
async fn test_hook_failures_are_collected() {
    let addr = free_addr();
    let graceful = Graceful::builder(example_router())
        .listener(Listener::addr(addr.to_string()))
        .before_shutdown("fails", |_ctx| async { Err::<(), _>("flush failed") })
        .before_shutdown("succeeds", |_ctx| async { Ok::<_, BoxError>(()) })
        .after_shutdown("panics", |_ctx| async {
            if true {
                panic!("hook exploded");
            }
            Ok::<_, BoxError>(())
        })
        .build()
        .unwrap();

    graceful.start().unwrap();
    wait_for_listener(addr).await;

    match graceful.shutdown(&ShutdownContext::background()).await {
        Err(Error::Shutdown(report)) => {
            assert_eq!(report.before.len(), 1);
            assert_eq!(report.before[0].name, "fails");
            assert_eq!(report.after.len(), 1);
            assert_eq!(report.after[0].phase, Phase::AfterShutdown);
            assert!(report.drain.is_empty());
            assert_eq!(report.hook_errors().count(), 2);
        }
        other => panic!("expected hook errors, got {other:?}"),
    }

    // Hook failures do not keep the servers running.
    wait_for_close(addr).await;
    graceful.stop().await.unwrap();
    graceful.close().await;
}

#[tokio::test]
async fn test_hooks_receive_shutdown_deadline() {
    let addr = free_addr();
    let seen = Arc::new(Mutex::new(None));
    let record = seen.clone();

    let graceful = Graceful::builder(example_router())
        .listener(Listener::addr(addr.to_string()))
        .shutdown_timeout(Duration::from_secs(7))
        .before_shutdown("deadline", move |ctx: ShutdownContext| {
            let record = record.clone();
            async move {
                *record.lock().unwrap() = ctx.remaining();
                Ok::<_, BoxError>(())
            }
        })
        .build()
        .unwrap();

    graceful.start().unwrap();
    wait_for_listener(addr).await;
    graceful.stop().await.unwrap();

    let remaining = seen.lock().unwrap().expect("hook ran with a deadline");
    assert!(remaining <= Duration::from_secs(7));
    assert!(remaining > Duration::from_secs(5));
    graceful.close().await;
}
