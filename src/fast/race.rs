//! Cancellable race between full generation and a cheap shortcut

use crate::error::{Result, RuntimeError};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Which side of a race produced the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceSource {
    Primary,
    Shortcut,
}

/// Run `primary` and `shortcut` concurrently.
///
/// The shortcut wins if it yields `Some`; a `None` leaves the primary to
/// finish. Whichever future loses is dropped, which aborts any request it had
/// in flight. Cancelling `cancel` abandons both.
pub async fn race<T, P, S>(cancel: &CancellationToken, primary: P, shortcut: S) -> Result<(T, RaceSource)>
where
    P: Future<Output = Result<T>>,
    S: Future<Output = Option<T>>,
{
    tokio::pin!(primary);
    tokio::pin!(shortcut);
    let mut shortcut_done = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(RuntimeError::Internal("request cancelled".to_string()));
            }
            hit = &mut shortcut, if !shortcut_done => match hit {
                Some(value) => return Ok((value, RaceSource::Shortcut)),
                None => shortcut_done = true,
            },
            result = &mut primary => {
                return result.map(|value| (value, RaceSource::Primary));
            }
        }
    }
}
