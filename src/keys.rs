//! SSH key operations delegated to agents: sign a challenge, let the user
//! pick a key, fetch a key's public half.

use serde::{Deserialize, Serialize};
use ssh_key::HashAlg;

use crate::broker::Broker;
use crate::error::{AgentError, Result};
use crate::protocol::{
    decode_bytes, public_key_request, select_key_request, sign_request, HashAlgorithm,
    KeyAlgorithm, EXTRA_ALGORITHM, EXTRA_KEY_DESCRIPTION, EXTRA_KEY_ID, EXTRA_PUBLIC_KEY,
    EXTRA_SIGNATURE,
};
use crate::types::{AgentId, AgentPayload, RequestOutcome};

/// A key that lives inside an agent, as remembered by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentKey {
    pub agent: AgentId,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `RSA`, `DSA`, `EC` or `Ed25519`.
    pub key_type: String,
    /// SSH wire encoding of the public key.
    pub public_key: Vec<u8>,
}

impl AgentKey {
    /// `SHA256:` fingerprint of the public key.
    pub fn fingerprint(&self) -> Result<String> {
        let key = ssh_key::PublicKey::from_bytes(&self.public_key)
            .map_err(|e| AgentError::protocol(format!("undecodable public key: {e}")))?;
        Ok(key.fingerprint(HashAlg::Sha256).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub algorithm: KeyAlgorithm,
    pub encoded: Vec<u8>,
    pub fingerprint: String,
}

impl PublicKeyInfo {
    pub fn key_type(&self) -> &'static str {
        self.algorithm.key_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    Selected(AgentKey),
    Canceled,
}

/// Validate the public key an agent returned: the reported algorithm must be
/// known and the blob must decode to a key of that algorithm.
pub fn parse_public_key_response(response: &AgentPayload) -> Result<PublicKeyInfo> {
    let encoded = decode_bytes(response, EXTRA_PUBLIC_KEY)?
        .ok_or_else(|| AgentError::protocol("no public key in agent response"))?;
    let code = response
        .extra_i64(EXTRA_ALGORITHM)
        .ok_or_else(|| AgentError::protocol("no key algorithm in agent response"))?;
    let algorithm = KeyAlgorithm::from_agent_code(code)?;

    let key = ssh_key::PublicKey::from_bytes(&encoded)
        .map_err(|e| AgentError::protocol(format!("undecodable public key: {e}")))?;
    if !algorithm.matches(&key.algorithm()) {
        return Err(AgentError::protocol(format!(
            "agent reported a {} key but sent {}",
            algorithm.key_type(),
            key.algorithm()
        )));
    }

    Ok(PublicKeyInfo {
        algorithm,
        fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        encoded,
    })
}

fn parse_selection(response: &AgentPayload) -> Result<(String, Option<String>)> {
    let key_id = response
        .extra_str(EXTRA_KEY_ID)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AgentError::protocol("no key id in agent response"))?;
    let description = response
        .extra_str(EXTRA_KEY_DESCRIPTION)
        .map(str::to_string);
    Ok((key_id.to_string(), description))
}

fn finish_selection(
    agent: AgentId,
    key_id: String,
    description: Option<String>,
    outcome: RequestOutcome,
) -> Result<KeySelection> {
    let response = match outcome {
        RequestOutcome::Success(response) => response,
        RequestOutcome::Failure(error) => return Err(error),
        RequestOutcome::Canceled => return Ok(KeySelection::Canceled),
    };
    let info = parse_public_key_response(&response)?;
    Ok(KeySelection::Selected(AgentKey {
        agent,
        key_id,
        description,
        key_type: info.key_type().to_string(),
        public_key: info.encoded,
    }))
}

#[derive(Clone)]
pub struct KeyService {
    broker: Broker,
}

impl KeyService {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Ask the key's agent to sign `challenge`. Blocks the calling thread.
    ///
    /// `Ok(None)` means the user canceled. An unsupported `hash_alg` fails
    /// before the agent is contacted.
    pub fn sign_challenge(
        &self,
        key: &AgentKey,
        challenge: &[u8],
        hash_alg: &str,
    ) -> Result<Option<Vec<u8>>> {
        let hash = HashAlgorithm::parse(hash_alg)?;
        tracing::debug!(
            target = "agent_broker::keys",
            agent = %key.agent,
            key_id = %key.key_id,
            hash = hash.as_str(),
            "requesting signature"
        );

        let request = sign_request(&key.key_id, challenge, hash);
        let Some(response) = self.broker.execute_blocking(key.agent.clone(), request)? else {
            return Ok(None);
        };
        let signature = decode_bytes(&response, EXTRA_SIGNATURE)?
            .ok_or_else(|| AgentError::protocol("no signature in agent response"))?;
        Ok(Some(signature))
    }

    /// Fetch and validate the public half of `key_id`. Blocks the calling
    /// thread; a user cancellation is reported as `UserCanceled`.
    pub fn fetch_public_key(&self, agent: &AgentId, key_id: &str) -> Result<PublicKeyInfo> {
        match self
            .broker
            .execute_blocking(agent.clone(), public_key_request(key_id))?
        {
            Some(response) => parse_public_key_response(&response),
            None => Err(AgentError::UserCanceled),
        }
    }

    /// Let the user pick a key in `agent`, then fetch its public key.
    ///
    /// Returns immediately. `on_done` runs once, on whichever thread resolves
    /// the last of the two requests.
    pub fn select_key<F>(&self, agent: AgentId, on_done: F)
    where
        F: FnOnce(Result<KeySelection>) + Send + 'static,
    {
        let broker = self.broker.clone();
        self.broker.execute_with_callback(
            agent.clone(),
            select_key_request(),
            move |outcome| {
                let response = match outcome {
                    RequestOutcome::Success(response) => response,
                    RequestOutcome::Failure(error) => return on_done(Err(error)),
                    RequestOutcome::Canceled => return on_done(Ok(KeySelection::Canceled)),
                };
                let (key_id, description) = match parse_selection(&response) {
                    Ok(selection) => selection,
                    Err(error) => return on_done(Err(error)),
                };

                tracing::debug!(
                    target = "agent_broker::keys",
                    agent = %agent,
                    key_id = %key_id,
                    "key selected, fetching public key"
                );
                let request = public_key_request(&key_id);
                broker.execute_with_callback(agent.clone(), request, move |outcome| {
                    on_done(finish_selection(agent, key_id, description, outcome))
                });
            },
        );
    }

    pub async fn select_key_async(&self, agent: AgentId) -> Result<KeySelection> {
        let response = match self.broker.execute(agent.clone(), select_key_request()).await {
            RequestOutcome::Success(response) => response,
            RequestOutcome::Failure(error) => return Err(error),
            RequestOutcome::Canceled => return Ok(KeySelection::Canceled),
        };
        let (key_id, description) = parse_selection(&response)?;
        let outcome = self
            .broker
            .execute(agent.clone(), public_key_request(&key_id))
            .await;
        finish_selection(agent, key_id, description, outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::{parse_public_key_response, AgentKey, KeySelection, KeyService};
    use crate::broker::Broker;
    use crate::error::AgentError;
    use crate::gateway::{AgentChannel, AgentTransport, Gateway};
    use crate::protocol::{
        encode_bytes, EXTRA_ALGORITHM, EXTRA_CHALLENGE, EXTRA_HASH_ALGORITHM, EXTRA_KEY_ID,
        EXTRA_PUBLIC_KEY, EXTRA_RESULT_CODE, EXTRA_SIGNATURE,
    };
    use crate::types::{AgentId, AgentPayload, CorrelationId};

    fn ed25519_blob() -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[7u8; 32]);
        blob
    }

    /// Answers by action; records every request.
    #[derive(Clone, Default)]
    struct ByAction {
        responses: Arc<Mutex<HashMap<String, AgentPayload>>>,
        seen: Arc<Mutex<Vec<AgentPayload>>>,
    }

    impl ByAction {
        fn answer(&self, action: &str, response: AgentPayload) {
            self.responses.lock().insert(action.to_string(), response);
        }
    }

    struct ByActionChannel(ByAction);

    impl AgentTransport for ByAction {
        fn bind<'a>(
            &'a self,
            _agent: &'a AgentId,
        ) -> BoxFuture<'a, Result<Box<dyn AgentChannel>, AgentError>> {
            Box::pin(async move {
                Ok(Box::new(ByActionChannel(self.clone())) as Box<dyn AgentChannel>)
            })
        }
    }

    impl AgentChannel for ByActionChannel {
        fn execute<'a>(
            &'a mut self,
            _correlation_id: CorrelationId,
            request: &'a AgentPayload,
        ) -> BoxFuture<'a, Result<AgentPayload, AgentError>> {
            Box::pin(async move {
                self.0.seen.lock().push(request.clone());
                self.0
                    .responses
                    .lock()
                    .get(&request.action)
                    .cloned()
                    .ok_or_else(|| AgentError::connection("no scripted answer"))
            })
        }
    }

    fn service(agent: &ByAction) -> KeyService {
        let gateway = Gateway::new(Arc::new(agent.clone()), Duration::from_secs(5));
        KeyService::new(Broker::builder(gateway).build().0)
    }

    fn ok(action: &str) -> AgentPayload {
        AgentPayload::new(action).with_extra(EXTRA_RESULT_CODE, 1)
    }

    fn public_key_answer() -> AgentPayload {
        ok("public_key")
            .with_extra(EXTRA_PUBLIC_KEY, encode_bytes(&ed25519_blob()))
            .with_extra(EXTRA_ALGORITHM, 3)
    }

    fn key() -> AgentKey {
        AgentKey {
            agent: AgentId::new("agent"),
            key_id: "k1".to_string(),
            description: None,
            key_type: "Ed25519".to_string(),
            public_key: ed25519_blob(),
        }
    }

    #[test]
    fn public_key_response_is_validated() {
        let info = parse_public_key_response(&public_key_answer()).unwrap();
        assert_eq!(info.key_type(), "Ed25519");
        assert!(info.fingerprint.starts_with("SHA256:"));
        assert_eq!(info.encoded, ed25519_blob());
    }

    #[test]
    fn mismatched_algorithm_is_protocol_error() {
        let response = public_key_answer().with_extra(EXTRA_ALGORITHM, 0);
        assert!(matches!(
            parse_public_key_response(&response),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_algorithm_code_is_unsupported() {
        let response = public_key_answer().with_extra(EXTRA_ALGORITHM, 9);
        assert!(matches!(
            parse_public_key_response(&response),
            Err(AgentError::AlgorithmUnsupported(_))
        ));
    }

    #[test]
    fn garbage_key_blob_is_protocol_error() {
        let response = public_key_answer().with_extra(EXTRA_PUBLIC_KEY, encode_bytes(b"nope"));
        assert!(matches!(
            parse_public_key_response(&response),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn agent_key_fingerprint_matches_public_key_info() {
        let info = parse_public_key_response(&public_key_answer()).unwrap();
        assert_eq!(key().fingerprint().unwrap(), info.fingerprint);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sign_challenge_sends_translated_hash() {
        let agent = ByAction::default();
        agent.answer("sign", ok("sign").with_extra(EXTRA_SIGNATURE, encode_bytes(b"sig")));
        let keys = service(&agent);

        let signature = tokio::task::spawn_blocking(move || {
            keys.sign_challenge(&key(), b"challenge", "rsa-sha2-512")
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(signature, Some(b"sig".to_vec()));

        let seen = agent.seen.lock();
        assert_eq!(seen[0].extra_str(EXTRA_KEY_ID), Some("k1"));
        assert_eq!(seen[0].extra_i64(EXTRA_HASH_ALGORITHM), Some(4));
        assert_eq!(
            seen[0].extra_str(EXTRA_CHALLENGE),
            Some(encode_bytes(b"challenge").as_str())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn success_without_signature_is_protocol_error() {
        let agent = ByAction::default();
        agent.answer("sign", ok("sign"));
        let keys = service(&agent);

        let result = tokio::task::spawn_blocking(move || {
            keys.sign_challenge(&key(), b"challenge", "SHA-256")
        })
        .await
        .unwrap();
        assert_eq!(
            result,
            Err(AgentError::protocol("no signature in agent response"))
        );
    }

    #[test]
    fn unsupported_hash_never_reaches_agent() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let agent = ByAction::default();
        let keys = runtime.block_on(async { service(&agent) });

        let result = keys.sign_challenge(&key(), b"challenge", "MD5");
        assert_eq!(result, Err(AgentError::AlgorithmUnsupported("MD5".into())));
        assert!(agent.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn select_key_chains_into_public_key_request() {
        let agent = ByAction::default();
        agent.answer(
            "select_key",
            ok("select_key")
                .with_extra(EXTRA_KEY_ID, "k7")
                .with_extra("key_description", "work laptop"),
        );
        agent.answer("public_key", public_key_answer());
        let keys = service(&agent);

        let (tx, rx) = oneshot::channel();
        keys.select_key(AgentId::new("agent"), move |result| {
            let _ = tx.send(result);
        });

        match rx.await.unwrap().unwrap() {
            KeySelection::Selected(selected) => {
                assert_eq!(selected.key_id, "k7");
                assert_eq!(selected.description.as_deref(), Some("work laptop"));
                assert_eq!(selected.key_type, "Ed25519");
                assert_eq!(selected.public_key, ed25519_blob());
            }
            KeySelection::Canceled => panic!("selection was not canceled"),
        }
        let seen = agent.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].action, "public_key");
        assert_eq!(seen[1].extra_str(EXTRA_KEY_ID), Some("k7"));
    }

    #[tokio::test]
    async fn select_key_without_key_id_fails() {
        let agent = ByAction::default();
        agent.answer("select_key", ok("select_key"));
        let keys = service(&agent);

        let result = keys.select_key_async(AgentId::new("agent")).await;
        assert!(matches!(result, Err(AgentError::Protocol(_))));
        assert_eq!(agent.seen.lock().len(), 1);
    }
}
