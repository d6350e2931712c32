use crate::contract::Contract;
use crate::error::{RecruitorError, RecruitorResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Executes one named action. The domain work (scraping, generation, CRM
/// sync, ...) lives behind this trait.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> RecruitorResult<serde_json::Value>;
}

/// Metadata describing an action's interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub input: Contract,
    pub output: Contract,
}

/// A capability a worker declares: a name, its contracts and the handler.
#[derive(Clone)]
pub struct Action {
    descriptor: ActionDescriptor,
    handler: Arc<dyn ActionHandler>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = RecruitorResult<serde_json::Value>> + Send,
{
    async fn handle(&self, payload: serde_json::Value) -> RecruitorResult<serde_json::Value> {
        (self.f)(payload).await
    }
}

struct TypedHandler<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, F, Fut> ActionHandler for TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = RecruitorResult<O>> + Send,
{
    async fn handle(&self, payload: serde_json::Value) -> RecruitorResult<serde_json::Value> {
        let input: I = serde_json::from_value(payload)
            .map_err(|e| RecruitorError::InvalidInput(e.to_string()))?;
        let output = (self.f)(input).await?;
        serde_json::to_value(output).map_err(|e| RecruitorError::InvalidOutput(e.to_string()))
    }
}

impl Action {
    /// Wraps an existing handler with the given contracts.
    pub fn new(
        name: impl Into<String>,
        input: Contract,
        output: Contract,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            descriptor: ActionDescriptor {
                name: name.into(),
                description: String::new(),
                input,
                output,
            },
            handler,
        }
    }

    /// Builds an action from an async closure over raw JSON.
    pub fn from_fn<F, Fut>(name: impl Into<String>, input: Contract, output: Contract, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RecruitorResult<serde_json::Value>> + Send + 'static,
    {
        Self::new(name, input, output, Arc::new(FnHandler { f }))
    }

    /// Builds an action whose input and output are serde types. The input
    /// contract is checked first; a payload that then fails to decode is
    /// reported as [`RecruitorError::InvalidInput`].
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, input: Contract, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RecruitorResult<O>> + Send + 'static,
    {
        Self::new(
            name,
            input,
            Contract::any(),
            Arc::new(TypedHandler {
                f,
                _types: PhantomData,
            }),
        )
    }

    /// Sets the human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    /// Replaces the output contract.
    pub fn with_output(mut self, output: Contract) -> Self {
        self.descriptor.output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    /// Validates the payload, runs the handler and validates its result.
    pub async fn invoke(&self, payload: serde_json::Value) -> RecruitorResult<serde_json::Value> {
        self.descriptor
            .input
            .validate(&payload)
            .map_err(|reason| {
                RecruitorError::InvalidInput(format!("{}: {reason}", self.descriptor.name))
            })?;

        let output = self.handler.handle(payload).await?;

        self.descriptor
            .output
            .validate(&output)
            .map_err(|reason| {
                RecruitorError::InvalidOutput(format!("{}: {reason}", self.descriptor.name))
            })?;
        Ok(output)
    }
}

/// The immutable set of actions a worker registers at construction time.
#[derive(Debug, Clone, Default)]
pub struct ActionSet {
    actions: HashMap<String, Action>,
    order: Vec<String>,
}

impl ActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an action. A later action with the same name replaces the earlier one.
    pub fn with(mut self, action: Action) -> Self {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// Looks up an action, failing with [`RecruitorError::UnknownAction`].
    pub fn require(&self, name: &str) -> RecruitorResult<&Action> {
        self.actions
            .get(name)
            .ok_or_else(|| RecruitorError::UnknownAction(name.to_string()))
    }

    /// Action names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn descriptors(&self) -> Vec<&ActionDescriptor> {
        self.order
            .iter()
            .filter_map(|n| self.actions.get(n))
            .map(Action::descriptor)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        iter.into_iter().fold(ActionSet::new(), ActionSet::with)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::contract::ValueKind;
    use serde_json::json;

    #[derive(Deserialize)]
    struct SearchInput {
        query: String,
    }

    #[derive(Serialize)]
    struct SearchOutput {
        hits: usize,
    }

    fn search_action() -> Action {
        Action::typed(
            "search",
            Contract::object().required("query", ValueKind::String),
            |input: SearchInput| async move {
                Ok(SearchOutput {
                    hits: input.query.len(),
                })
            },
        )
    }

    #[tokio::test]
    async fn test_typed_action_roundtrip() {
        let out = search_action().invoke(json!({"query": "rust"})).await.unwrap();
        assert_eq!(out, json!({"hits": 4}));
    }

    #[tokio::test]
    async fn test_input_contract_violation() {
        let err = search_action().invoke(json!({"q": "rust"})).await.unwrap_err();
        assert!(matches!(err, RecruitorError::InvalidInput(_)));
        assert!(err.to_string().contains("query"));
    }

    #[tokio::test]
    async fn test_output_contract_violation() {
        let action = Action::from_fn(
            "analyze",
            Contract::any(),
            Contract::object().required("score", ValueKind::Number),
            |_payload| async move { Ok(json!({"verdict": "good"})) },
        );
        let err = action.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, RecruitorError::InvalidOutput(_)));
    }

    #[test]
    fn test_action_set_lookup() {
        let set: ActionSet = vec![search_action()].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.get("search").is_some());
        assert!(matches!(
            set.require("scrape"),
            Err(RecruitorError::UnknownAction(name)) if name == "scrape"
        ));
        assert_eq!(set.names(), vec!["search".to_string()]);
    }
}
