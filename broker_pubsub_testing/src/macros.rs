//! Assertion macros shared by test helpers and integration tests.

/// Await a cursor pull that must yield a payload, panicking with contextual
/// diagnostics otherwise. An optional timeout guards against hangs.
#[macro_export]
macro_rules! next_expect {
    ($cursor:expr) => {{
        $crate::next_expect!($cursor, ::std::time::Duration::from_secs(5))
    }};
    ($cursor:expr, $timeout:expr) => {{
        ::tokio::time::timeout($timeout, $cursor.next())
            .await
            .expect(concat!("next timed out at ", file!(), ":", line!()))
            .expect(concat!("next failed at ", file!(), ":", line!()))
            .expect(concat!("cursor ended early at ", file!(), ":", line!()))
    }};
}

/// Await a publish future and panic with contextual diagnostics on failure.
#[macro_export]
macro_rules! publish_expect {
    ($fut:expr) => {{
        $fut.await
            .expect(concat!("publish failed at ", file!(), ":", line!()))
    }};
    ($fut:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $fut.await.expect(&m)
    }};
}

pub use crate::{next_expect, publish_expect};
