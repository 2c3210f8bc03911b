//! The `model → session` routing table.
//!
//! Registration order decides ownership: the first live session to declare a
//! model owns it until it unregisters, whereupon the earliest remaining
//! declarer is promoted. A model never resolves to two sessions at once.
//!
//! Mutations come from session lifecycle, reads from HTTP handlers; both go
//! through one mutex. Reads are infrequent relative to request traffic, so
//! contention is not a concern and correctness is.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_types::SessionId;
use secrecy::SecretString;

/// Routing result: the owning session and the credential to inject.
#[derive(Debug)]
pub(crate) struct Route {
    /// The session that owns the model.
    pub(crate) session_id: SessionId,
    /// Upstream credential bound to the session's token, if any.
    pub(crate) credential: Option<SecretString>,
}

/// Why a model could not be routed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RouteError {
    /// No live session has declared the model.
    #[error("model not found")]
    UnknownModel,
    /// The model is known but momentarily has no live owner.
    #[error("no connector for model")]
    NoConnector,
}

#[derive(Default)]
struct RouterInner {
    /// Candidate sessions per model, in registration order; index 0 owns.
    candidates: HashMap<String, Vec<SessionId>>,
    /// Per-session upstream credential, as registered.
    credentials: HashMap<SessionId, Option<SecretString>>,
}

/// The routing table, shared between session lifecycle and HTTP handlers.
#[derive(Default, Clone)]
pub(crate) struct ModelRouter(Arc<Mutex<RouterInner>>);

impl ModelRouter {
    /// Adds a session's models; models owned by another live session are not
    /// stolen.
    pub(crate) fn on_register(
        &self,
        session_id: SessionId,
        models: &[String],
        credential: Option<SecretString>,
    ) {
        let mut inner = self.0.lock();
        inner.credentials.insert(session_id, credential);
        for model in models {
            let candidates = inner.candidates.entry(model.clone()).or_default();
            if !candidates.contains(&session_id) {
                candidates.push(session_id);
            }
        }
    }

    /// Removes every mapping pointing at the session and promotes the next
    /// declarer of each affected model, if any.
    pub(crate) fn on_unregister(&self, session_id: SessionId) {
        let mut inner = self.0.lock();
        inner.credentials.remove(&session_id);
        inner.candidates.retain(|_, candidates| {
            candidates.retain(|candidate| *candidate != session_id);
            !candidates.is_empty()
        });
    }

    /// Resolves a model to its owning session and credential.
    pub(crate) fn get_route(&self, model: &str) -> Result<Route, RouteError> {
        let inner = self.0.lock();
        let candidates = inner.candidates.get(model).ok_or(RouteError::UnknownModel)?;
        let session_id = *candidates.first().ok_or(RouteError::NoConnector)?;
        let credential = inner
            .credentials
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        Ok(Route {
            session_id,
            credential,
        })
    }

    /// The union of currently routable model names, sorted.
    pub(crate) fn models(&self) -> Vec<String> {
        let inner = self.0.lock();
        let mut models = inner.candidates.keys().cloned().collect::<Vec<_>>();
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|m| (*m).to_owned()).collect()
    }

    #[test]
    fn first_registration_wins() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        let b = SessionId::fresh();
        router.on_register(a, &models(&["llama3.2"]), None);
        router.on_register(b, &models(&["llama3.2", "qwen2.5"]), None);

        assert_eq!(router.get_route("llama3.2").expect("routed").session_id, a);
        assert_eq!(router.get_route("qwen2.5").expect("routed").session_id, b);
    }

    #[test]
    fn unregister_promotes_the_next_declarer() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        let b = SessionId::fresh();
        router.on_register(a, &models(&["llama3.2"]), None);
        router.on_register(b, &models(&["llama3.2"]), None);

        router.on_unregister(a);
        assert_eq!(router.get_route("llama3.2").expect("routed").session_id, b);
        assert_eq!(router.models(), models(&["llama3.2"]));
    }

    #[test]
    fn unregister_removes_every_mapping_of_the_session() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        router.on_register(a, &models(&["llama3.2", "qwen2.5"]), None);

        router.on_unregister(a);
        assert_eq!(
            router.get_route("llama3.2").expect_err("gone"),
            RouteError::UnknownModel
        );
        assert!(router.models().is_empty());
    }

    #[test]
    fn register_unregister_is_the_identity() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        router.on_register(a, &models(&["llama3.2"]), None);
        let before = router.models();

        let b = SessionId::fresh();
        router.on_register(b, &models(&["qwen2.5"]), None);
        router.on_unregister(b);

        assert_eq!(router.models(), before);
        assert_eq!(router.get_route("llama3.2").expect("routed").session_id, a);
    }

    #[test]
    fn duplicate_model_names_in_one_declaration_are_deduped() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        router.on_register(a, &models(&["llama3.2", "llama3.2"]), None);

        router.on_unregister(a);
        // one unregister fully clears the model
        assert!(router.models().is_empty());
    }

    #[test]
    fn credential_travels_with_the_route() {
        let router = ModelRouter::default();
        let a = SessionId::fresh();
        router.on_register(
            a,
            &models(&["llama3.2"]),
            Some(SecretString::from("sk-upstream".to_owned())),
        );

        let route = router.get_route("llama3.2").expect("routed");
        assert!(route.credential.is_some());
    }
}
