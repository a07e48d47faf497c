mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{
    AppError, CallOptions, ErrorCode, HandlerError, Init, RpcError, Validate, ValidationError,
};
use tokio::time::Instant;

use common::{connect, within, QUIET};

#[derive(Debug, PartialEq)]
enum AccountError {
    NotFound(String),
    AlreadyExists(String),
}

impl AppError for AccountError {
    fn code(&self) -> u32 {
        match self {
            Self::NotFound(_) => 1,
            Self::AlreadyExists(_) => 2,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::NotFound(name) | Self::AlreadyExists(name) => name.clone(),
        }
    }

    fn from_status(code: u32, message: &str) -> Option<Self> {
        match code {
            1 => Some(Self::NotFound(message.to_owned())),
            2 => Some(Self::AlreadyExists(message.to_owned())),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Login {
    user: String,
    password: String,
}

impl Validate for Login {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.user.is_empty() {
            return Err(ValidationError::new("user", "required"));
        }
        if self.password.len() < 8 {
            return Err(ValidationError::new("password", "too short"));
        }
        Ok(())
    }
}

fn accounts() -> Init {
    Init::new()
        .call("add", |_ctx, (a, b): (i32, i32)| async move {
            Ok::<_, HandlerError>(a + b)
        })
        .call("lookup", |_ctx, name: String| async move {
            if name == "alice" {
                Ok(42u64)
            } else {
                Err(HandlerError::app(&AccountError::NotFound(name)))
            }
        })
        .call("login", |_ctx, login: Login| async move {
            Ok::<_, HandlerError>(login.user)
        })
        .call("broken", |_ctx, _: ()| async move {
            Err::<(), _>(HandlerError::internal("database password is hunter2"))
        })
        .call("explode", |_ctx, _: ()| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<(), HandlerError>(())
        })
}

#[tokio::test]
async fn call_round_trip() {
    let (client, _server) = connect(Init::new(), accounts()).await;
    let sum: i32 = within(client.control.call("add", &(2, 3))).await.unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn both_sides_can_serve_calls() {
    let (client, server) = connect(accounts(), accounts()).await;
    let a: i32 = within(client.control.call("add", &(1, 1))).await.unwrap();
    let b: i32 = within(server.control.call("add", &(2, 2))).await.unwrap();
    assert_eq!((a, b), (2, 4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_responses() {
    let server = Init::new().call("echo", |_ctx, n: u32| async move {
        // Later requests finish first.
        tokio::time::sleep(Duration::from_millis(u64::from(64 - n))).await;
        Ok::<_, HandlerError>(n)
    });
    let (client, _server) = connect(Init::new(), server).await;

    let calls = (0..64u32).map(|n| {
        let control = client.control.clone();
        tokio::spawn(async move { (n, control.call::<_, u32>("echo", &n).await) })
    });
    for call in calls.collect::<Vec<_>>() {
        let (sent, got) = within(call).await.unwrap();
        assert_eq!(got.unwrap(), sent);
    }
    assert!(client.control.pending_calls().is_empty());
}

#[tokio::test]
async fn application_errors_round_trip() {
    let (client, _server) = connect(Init::new(), accounts()).await;
    let err = within(client.control.call::<_, u64>("lookup", "bob"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::Application(1)));
    assert_eq!(
        err.app_error::<AccountError>(),
        Some(AccountError::NotFound("bob".into()))
    );
    assert_eq!(
        err,
        RpcError::Status {
            code: ErrorCode::Application(1),
            message: "bob".into()
        }
    );
}

#[tokio::test]
async fn application_codes_above_i32_range_round_trip() {
    let server = Init::new().call("quota", |_ctx, _: ()| async move {
        Err::<(), _>(HandlerError::application(3_000_000_000, "quota exhausted"))
    });
    let (client, _server) = connect(Init::new(), server).await;

    let err = within(client.control.call::<_, ()>("quota", &()))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RpcError::Status {
            code: ErrorCode::Application(3_000_000_000),
            message: "quota exhausted".into()
        }
    );
}

#[tokio::test]
async fn validation_failure_is_invalid_argument() {
    let (client, _server) = connect(Init::new(), accounts()).await;
    let login = Login {
        user: "alice".into(),
        password: "short".into(),
    };
    let err = within(client.control.call::<_, String>("login", &login))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
    assert!(err.to_string().contains("password"));
}

#[tokio::test]
async fn malformed_argument_is_reported() {
    let (client, _server) = connect(Init::new(), accounts()).await;
    // A bool where a tuple of two i32 is expected.
    let err = within(client.control.call::<_, i32>("add", &true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::MalformedPayload));
}

#[tokio::test]
async fn unknown_call_is_call_not_found() {
    let (client, _server) = connect(Init::new(), accounts()).await;
    let err = within(client.control.call::<_, ()>("nope", &()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::CallNotFound));
}

#[tokio::test]
async fn internal_failures_hide_details() {
    let (client, _server) = connect(Init::new(), accounts()).await;

    let err = within(client.control.call::<_, ()>("broken", &()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Uncategorized));
    assert!(!err.to_string().contains("hunter2"));

    let err = within(client.control.call::<_, ()>("explode", &()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Uncategorized));

    // The session survives both.
    let sum: i32 = within(client.control.call("add", &(1, 2))).await.unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn expired_deadline_never_reaches_the_handler() {
    let reached = Arc::new(AtomicBool::new(false));
    let server = {
        let reached = reached.clone();
        Init::new().call("slow", move |_ctx, _: ()| {
            let reached = reached.clone();
            async move {
                reached.store(true, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        })
    };
    let (client, _server) = connect(Init::new(), server).await;

    let err = within(client.control.call_deadline::<_, ()>("slow", &(), Instant::now()))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(QUIET).await;
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn registered_timeout_bounds_the_wait_and_late_results_are_dropped() {
    let finished = Arc::new(AtomicUsize::new(0));
    let server = {
        let finished = finished.clone();
        Init::new().setup(move |control, _| {
            control.register_call("slow", Duration::from_millis(50), move |ctx, _: ()| {
                let finished = finished.clone();
                async move {
                    assert!(ctx.remaining() <= Duration::from_millis(50));
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(())
                }
            });
        })
    };
    let (client, _server) = connect(Init::new(), server).await;

    // The caller uses the same ceiling as the handler registration.
    let options = CallOptions::default().with_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let err = within(client.control.async_call::<_, ()>("slow", &(), options))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(client.control.pending_calls().is_empty());

    // The handler still runs to completion; its response is discarded.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn large_payloads_need_an_async_call() {
    let blob_options = CallOptions::new(Duration::from_secs(5), 1 << 20, 16);
    let server = Init::new().call_with("upload", blob_options, |_ctx, blob: Vec<u8>| async move {
        Ok::<_, HandlerError>(blob.len() as u64)
    });
    let (client, _server) = connect(Init::new(), server).await;
    let blob = vec![7u8; 256 * 1024];

    // Refused locally by the synchronous ceiling.
    let err = within(client.control.call::<_, u64>("upload", &blob))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PayloadTooLarge { .. }));

    let len: u64 = within(client.control.async_call("upload", &blob, blob_options))
        .await
        .unwrap();
    assert_eq!(len, blob.len() as u64);
}

#[tokio::test]
async fn handler_enforces_its_own_argument_ceiling() {
    let small = CallOptions::new(Duration::from_secs(5), 16, 16);
    let server = Init::new().call_with("tiny", small, |_ctx, blob: Vec<u8>| async move {
        Ok::<_, HandlerError>(blob.len() as u64)
    });
    let (client, _server) = connect(Init::new(), server).await;

    // The caller allows it, the handler does not.
    let err = within(client.control.async_call::<_, u64>("tiny", &vec![0u8; 1024], CallOptions::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PayloadTooLarge));
}

#[tokio::test]
async fn oversized_return_is_refused() {
    let server = Init::new().call("big", |_ctx, n: usize| async move {
        Ok::<_, HandlerError>(vec![1u8; n])
    });
    let (client, _server) = connect(Init::new(), server).await;

    let err = within(client.control.call::<_, Vec<u8>>("big", &(128 * 1024usize)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PayloadTooLarge));
}

#[tokio::test]
async fn peer_close_fails_pending_calls() {
    let server = Init::new().call("hang", |_ctx, _: ()| async move {
        std::future::pending::<()>().await;
        Ok::<_, HandlerError>(())
    });
    let (client, server) = connect(Init::new(), server).await;

    let call = {
        let control = client.control.clone();
        tokio::spawn(async move { control.call::<_, ()>("hang", &()).await })
    };
    tokio::time::sleep(QUIET).await;
    server.session.close();

    assert_eq!(within(call).await.unwrap(), Err(RpcError::Closed));
}

#[tokio::test]
async fn raw_calls_skip_the_codec() {
    let server = Init::new().setup(|control, _| {
        control.register_raw_call("reverse", control.default_options(), |_ctx, arg| async move {
            let mut bytes = arg.to_vec();
            bytes.reverse();
            Ok(bytes)
        });
    });
    let (client, _server) = connect(Init::new(), server).await;

    let ret = within(client.control.call_raw(
        "reverse",
        bytes::Bytes::from_static(b"abc"),
        CallOptions::default(),
        None,
    ))
    .await
    .unwrap();
    assert_eq!(&ret[..], b"cba");
}
