//! Top-level facade binding settings, logging, the token verifier, and the
//! storage [`Dispatcher`] into the single object an (out of scope) HTTP
//! layer would hold for the lifetime of the process.
//!
//! Grounded on the teacher's `src/lib.rs` module list, trimmed to the
//! modules this workspace still owns: `db`/`web`/`server`/`auth` moved out
//! into their own crates (`syncstorage-db`, `syncstorage-token`) or out of
//! scope entirely (the HTTP router), leaving `logging` as the only thing
//! left for this crate to own directly.

pub mod logging;

pub use syncstorage_common::{DbError, DbErrorIntrospect, DbErrorKind, SyncTimestamp};
pub use syncstorage_db::{
    Bso, BsoWrite, Dispatcher, GetBsosRequest, GetBsosResponse, PostBsosResult, Sorting, Usage,
};
pub use syncstorage_settings::Settings;
pub use syncstorage_token::{CryptoImpl, TokenError, TokenPayload, VerifiedToken};

/// The process-wide entry point: one [`Dispatcher`] (itself sharded into
/// per-CPU [`syncstorage_db::pool::Pool`]s) plus the bearer-token
/// verifier, both built from the same [`Settings`]. An (out of scope)
/// HTTP layer holds one of these for the lifetime of the process and
/// calls through it for every request.
pub struct Core {
    pub settings: Settings,
    pub dispatcher: Dispatcher,
    crypto: CryptoImpl,
}

impl Core {
    pub fn new(settings: Settings) -> Self {
        let dispatcher = Dispatcher::new(&settings);
        Core {
            settings,
            dispatcher,
            crypto: CryptoImpl::default(),
        }
    }

    /// Verifies a bearer token against the configured secret list, trying
    /// each in order (most recent first) per §4.4's rotation policy.
    pub fn verify_token(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let now = SyncTimestamp::now().as_seconds();
        syncstorage_token::verify_token(&self.crypto, token, &self.settings.secrets.values, now)
    }

    /// Shuts down the dispatcher, draining every shard's pool. Further
    /// calls through `self.dispatcher` return `DbErrorKind::Closed`.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.data_dir = ":memory:".to_string();
        settings.pool.num = 1;
        settings.pool.size = 4;
        settings.secrets = syncstorage_settings::Secrets::new("test-secret").unwrap();
        settings
    }

    #[test]
    fn core_wires_dispatcher_and_verifier_from_one_settings() {
        let core = Core::new(test_settings());
        assert!(core.dispatcher.info_collections(42).is_ok());

        let crypto = CryptoImpl::default();
        let payload = TokenPayload {
            uid: 42,
            node: "http://localhost".to_string(),
            expires: SyncTimestamp::now().as_seconds() + 3600.0,
        };
        let (token, _) = syncstorage_token::make_token(&crypto, payload.clone(), "test-secret").unwrap();

        let verified = core.verify_token(&token).unwrap();
        assert_eq!(verified.payload, payload);
    }

    #[test]
    fn shutdown_closes_the_dispatcher() {
        let core = Core::new(test_settings());
        core.shutdown();
        let err = core.dispatcher.info_collections(1).unwrap_err();
        assert!(matches!(err.kind, DbErrorKind::Closed));
    }
}
