//! Failure classification and recovery decisions.
//!
//! Both transports first classify what went wrong, then ask this module what to do about it.

use reqwest::StatusCode;

use crate::error::Kind;

/// WebSocket close code for a normal, intentional closure.
pub const NORMAL_CLOSE: u16 = 1000;

/// What went wrong with an HTTP call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// No response at all: connect failure, timeout, aborted transfer
    NoResponse,
    /// The server answered with a non-success status
    Status(StatusCode),
}

/// Per-call facts the decision depends on.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempt {
    /// The call already went through one renewal and was re-issued
    pub retried: bool,
    /// The call bypasses credential handling (the renewal call itself, login, public endpoints)
    pub skip_auth: bool,
}

impl Attempt {
    #[must_use]
    pub const fn first(skip_auth: bool) -> Self {
        Self {
            retried: false,
            skip_auth,
        }
    }

    #[must_use]
    pub const fn retry(self) -> Self {
        Self {
            retried: true,
            ..self
        }
    }
}

/// What the HTTP transport does with a failure.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Renew credentials once, then re-issue the original call
    RefreshAndRetry,
    /// Drop the credentials and report an unrecoverable [`Kind::Auth`] failure
    ExpireSession,
    /// Return the failure to the caller as `kind`, notifying the user unless `silent`
    Surface { kind: Kind, silent: bool },
}

/// Choose the single recovery action for `failure` on `attempt`.
#[must_use]
pub fn decide(failure: Failure, attempt: Attempt) -> Action {
    match failure {
        Failure::NoResponse => Action::Surface {
            kind: Kind::Network,
            silent: false,
        },
        Failure::Status(StatusCode::UNAUTHORIZED) if !attempt.skip_auth => {
            if attempt.retried {
                Action::ExpireSession
            } else {
                Action::RefreshAndRetry
            }
        }
        // Not-found is never shown to the user
        Failure::Status(StatusCode::NOT_FOUND) => Action::Surface {
            kind: Kind::Status,
            silent: true,
        },
        Failure::Status(_) => Action::Surface {
            kind: Kind::Status,
            silent: false,
        },
    }
}

/// What the connection manager does when the socket goes away.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Terminal: the peer (or we) closed normally
    Stay,
    /// Start or continue the backoff sequence
    Reconnect,
}

/// Decide whether a close with `code` should be recovered. `None` means the socket dropped
/// without a close frame.
#[must_use]
pub fn on_close(code: Option<u16>) -> CloseAction {
    match code {
        Some(NORMAL_CLOSE) => CloseAction::Stay,
        _ => CloseAction::Reconnect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_unauthorized_refreshes() {
        let action = decide(
            Failure::Status(StatusCode::UNAUTHORIZED),
            Attempt::first(false),
        );
        assert_eq!(action, Action::RefreshAndRetry);
    }

    #[test]
    fn unauthorized_after_retry_expires_session() {
        let action = decide(
            Failure::Status(StatusCode::UNAUTHORIZED),
            Attempt::first(false).retry(),
        );
        assert_eq!(action, Action::ExpireSession);
    }

    #[test]
    fn unauthorized_on_skip_auth_call_is_surfaced() {
        let action = decide(
            Failure::Status(StatusCode::UNAUTHORIZED),
            Attempt::first(true),
        );
        assert_eq!(
            action,
            Action::Surface {
                kind: Kind::Status,
                silent: false
            }
        );
    }

    #[test]
    fn not_found_is_silent_and_server_error_is_not() {
        assert_eq!(
            decide(Failure::Status(StatusCode::NOT_FOUND), Attempt::default()),
            Action::Surface {
                kind: Kind::Status,
                silent: true
            }
        );
        assert_eq!(
            decide(
                Failure::Status(StatusCode::INTERNAL_SERVER_ERROR),
                Attempt::default()
            ),
            Action::Surface {
                kind: Kind::Status,
                silent: false
            }
        );
    }

    #[test]
    fn no_response_is_a_network_failure_without_retry() {
        for attempt in [Attempt::first(false), Attempt::first(false).retry()] {
            assert_eq!(
                decide(Failure::NoResponse, attempt),
                Action::Surface {
                    kind: Kind::Network,
                    silent: false
                }
            );
        }
    }

    #[test]
    fn only_normal_close_stays_closed() {
        assert_eq!(on_close(Some(NORMAL_CLOSE)), CloseAction::Stay);
        assert_eq!(on_close(Some(1001)), CloseAction::Reconnect);
        assert_eq!(on_close(Some(1006)), CloseAction::Reconnect);
        assert_eq!(on_close(None), CloseAction::Reconnect);
    }
}
