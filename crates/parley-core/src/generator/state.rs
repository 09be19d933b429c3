//! State-machine generator that swaps its inner generator as the
//! conversation moves between phases.
//!
//! A [`StatePolicy`] decides the next state once per non-dry call and builds
//! the inner generator for each state. The history of states is append-only
//! and persisted, so a restored session rebuilds the same inner generator
//! without asking the policy for transitions again.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info};

use super::{Generation, ResponseGenerator};
use crate::dialogue::{DialogueTurn, Metadata};
use crate::error::{Error, Result};

/// Metadata key carrying the state a reply was generated in.
pub const STATE_KEY: &str = "state";

/// Metadata key carrying that state's payload.
pub const PAYLOAD_KEY: &str = "payload";

/// Values usable as states.
pub trait StateKey: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StateKey for T where T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Decision returned by [`StatePolicy::calc_next_state_info`].
#[derive(Debug, Clone, PartialEq)]
pub enum NextState<S> {
    /// Keep the current state and generator.
    Stay,
    /// Move to `state`, building a generator for it.
    Transition { state: S, payload: Option<Value> },
    /// Keep the state but update the active generator in place.
    Update(Value),
}

/// One entry of the state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord<S> {
    pub state: S,
    pub payload: Option<Value>,
    /// Recorded from [`NextState::Update`] rather than a transition.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub update: bool,
}

impl<S> StateRecord<S> {
    pub fn transition(state: S, payload: Option<Value>) -> Self {
        Self {
            state,
            payload,
            update: false,
        }
    }

    pub fn update(state: S, payload: Value) -> Self {
        Self {
            state,
            payload: Some(payload),
            update: true,
        }
    }
}

/// The payload each state held when it was last left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent, bound(deserialize = "S: DeserializeOwned"))]
pub struct PayloadMemory<S>(Vec<(S, Option<Value>)>);

impl<S> Default for PayloadMemory<S> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<S: PartialEq> PayloadMemory<S> {
    /// Payload `state` last ended with, if it was ever left with one.
    pub fn get(&self, state: &S) -> Option<&Value> {
        self.0
            .iter()
            .find(|(s, _)| s == state)
            .and_then(|(_, payload)| payload.as_ref())
    }

    pub fn contains(&self, state: &S) -> bool {
        self.0.iter().any(|(s, _)| s == state)
    }

    fn remember(&mut self, state: S, payload: Option<Value>) {
        match self.0.iter_mut().find(|(s, _)| *s == state) {
            Some(entry) => entry.1 = payload,
            None => self.0.push((state, payload)),
        }
    }
}

/// Drives a [`StateBasedResponseGenerator`].
///
/// `memory` holds the payload of every state left so far, so a policy can
/// resume a revisited state where it stopped.
#[async_trait]
pub trait StatePolicy<S: StateKey>: Send + Sync {
    type Generator: ResponseGenerator;

    /// Build the generator for `state`.
    async fn get_generator(
        &mut self,
        state: &S,
        payload: Option<&Value>,
        memory: &PayloadMemory<S>,
    ) -> Result<Self::Generator>;

    /// Apply `payload` to the active generator without rebuilding it.
    fn update_generator(&mut self, generator: &mut Self::Generator, payload: &Value) -> Result<()>;

    /// Decide what happens before the next reply is generated.
    async fn calc_next_state_info(
        &mut self,
        current: &S,
        dialogue: &[DialogueTurn],
        history: &[StateRecord<S>],
        memory: &PayloadMemory<S>,
    ) -> Result<NextState<S>>;
}

/// Persisted form.
#[derive(Serialize, Deserialize)]
#[serde(bound(deserialize = "S: DeserializeOwned"))]
struct Parcel<S> {
    state_history: Vec<StateRecord<S>>,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    payload_memory: PayloadMemory<S>,
}

/// Delegates to a per-state inner generator chosen by a [`StatePolicy`].
pub struct StateBasedResponseGenerator<S: StateKey, P: StatePolicy<S>> {
    policy: P,
    history: Vec<StateRecord<S>>,
    payload_memory: PayloadMemory<S>,
    current: Option<P::Generator>,
    verbose: bool,
}

impl<S: StateKey, P: StatePolicy<S>> StateBasedResponseGenerator<S, P> {
    pub fn new(policy: P, initial_state: S, initial_payload: Option<Value>) -> Self {
        Self {
            policy,
            history: vec![StateRecord::transition(initial_state, initial_payload)],
            payload_memory: PayloadMemory::default(),
            current: None,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn history(&self) -> &[StateRecord<S>] {
        &self.history
    }

    /// The active inner generator, once built.
    pub fn current_generator(&self) -> Option<&P::Generator> {
        self.current.as_ref()
    }

    fn last_record(&self) -> Result<&StateRecord<S>> {
        self.history
            .last()
            .ok_or_else(|| Error::State("state history is empty".into()))
    }

    pub fn current_state(&self) -> Option<&S> {
        self.history.last().map(|r| &r.state)
    }

    pub fn current_payload(&self) -> Option<&Value> {
        self.history.last().and_then(|r| r.payload.as_ref())
    }

    pub fn payload_memory(&self) -> &PayloadMemory<S> {
        &self.payload_memory
    }

    /// Payload `state` last ended with, if it was ever left.
    pub fn memoized_payload(&self, state: &S) -> Option<&Value> {
        self.payload_memory.get(state)
    }

    /// Number of transitions into `state`, including the initial one.
    pub fn state_num_appearance(&self, state: &S) -> usize {
        state_num_appearance(&self.history, state)
    }

    /// Build the generator for the most recent run of identical states.
    ///
    /// The run's earliest payload builds the generator; every later payload
    /// in the run is replayed through `update_generator` in order.
    async fn rebuild_generator(&mut self) -> Result<P::Generator> {
        let last = self.last_record()?;
        let start = self
            .history
            .iter()
            .rposition(|r| r.state != last.state)
            .map_or(0, |i| i + 1);

        let first = self.history[start].clone();
        let mut generator = self
            .policy
            .get_generator(&first.state, first.payload.as_ref(), &self.payload_memory)
            .await?;
        for record in &self.history[start + 1..] {
            if let Some(payload) = &record.payload {
                self.policy.update_generator(&mut generator, payload)?;
            }
        }
        debug!(state = ?first.state, replayed = self.history.len() - start - 1, "Rebuilt generator");
        Ok(generator)
    }

    async fn apply(&mut self, next: NextState<S>) -> Result<()> {
        match next {
            NextState::Stay => {}
            NextState::Transition { state, payload } => {
                let previous = self.last_record()?.clone();
                self.payload_memory.remember(previous.state.clone(), previous.payload);
                if self.verbose {
                    info!(from = ?previous.state, to = ?state, "State transition");
                } else {
                    debug!(from = ?previous.state, to = ?state, "State transition");
                }
                self.current = Some(
                    self.policy
                        .get_generator(&state, payload.as_ref(), &self.payload_memory)
                        .await?,
                );
                self.history.push(StateRecord::transition(state, payload));
            }
            NextState::Update(payload) => {
                let mut generator = match self.current.take() {
                    Some(generator) => generator,
                    None => self.rebuild_generator().await?,
                };
                debug!("Updating generator with payload");
                self.policy.update_generator(&mut generator, &payload)?;
                self.current = Some(generator);
                let state = self.last_record()?.state.clone();
                self.history.push(StateRecord::update(state, payload));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: StateKey, P: StatePolicy<S>> ResponseGenerator for StateBasedResponseGenerator<S, P> {
    async fn initialize(&mut self) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(self.rebuild_generator().await?);
        }
        match self.current.as_mut() {
            Some(generator) => generator.initialize().await,
            None => Ok(()),
        }
    }

    async fn generate_response_impl(&mut self, dialogue: &[DialogueTurn], dry: bool) -> Result<Generation> {
        if !dry {
            let current = self.last_record()?.state.clone();
            let next = self
                .policy
                .calc_next_state_info(&current, dialogue, &self.history, &self.payload_memory)
                .await?;
            self.apply(next).await?;
        }

        if self.current.is_none() {
            self.current = Some(self.rebuild_generator().await?);
        }
        let Some(generator) = self.current.as_mut() else {
            return Err(Error::State("no active generator".into()));
        };
        let response = generator.get_response(dialogue, dry).await?;

        let record = self.last_record()?;
        let mut metadata = response.metadata;
        metadata
            .entry(STATE_KEY)
            .or_insert(serde_json::to_value(&record.state)?);
        metadata
            .entry(PAYLOAD_KEY)
            .or_insert(record.payload.clone().unwrap_or(Value::Null));

        Ok(Generation::reply(response.text, metadata))
    }

    fn write_to_json(&self, parcel: &mut Metadata) -> Result<()> {
        let value = serde_json::to_value(Parcel {
            state_history: self.history.clone(),
            verbose: self.verbose,
            payload_memory: self.payload_memory.clone(),
        })?;
        if let Value::Object(fields) = value {
            parcel.extend(fields);
        }
        Ok(())
    }

    async fn restore_from_json(&mut self, parcel: &Metadata) -> Result<()> {
        let restored: Parcel<S> = serde_json::from_value(Value::Object(parcel.clone()))?;
        if restored.state_history.is_empty() {
            return Err(Error::State("persisted state history is empty".into()));
        }
        self.history = restored.state_history;
        self.verbose = restored.verbose;
        self.payload_memory = restored.payload_memory;
        self.current = Some(self.rebuild_generator().await?);
        Ok(())
    }
}

/// Number of transitions into `state` in `history`. Update entries are not counted.
pub fn state_num_appearance<S: PartialEq>(history: &[StateRecord<S>], state: &S) -> usize {
    history.iter().filter(|r| !r.update && &r.state == state).count()
}

/// Keep only the turns covering the last `n` runs of system-turn states.
///
/// Walks backward over system turns, grouping consecutive turns that share
/// `metadata.state`. The result starts at the first system turn of the
/// oldest retained run. If the dialogue has `n` runs or fewer it is
/// returned whole.
pub fn trim_dialogue_to_recent_n_states(dialogue: &[DialogueTurn], n: usize) -> &[DialogueTurn] {
    let mut runs = 0;
    let mut current: Option<&Value> = None;
    let mut run_start = dialogue.len();

    for (idx, turn) in dialogue.iter().enumerate().rev() {
        if turn.is_user {
            continue;
        }
        let state = turn.metadata_value(&[STATE_KEY]);
        if runs == 0 || current != state {
            if runs >= n {
                return &dialogue[run_start..];
            }
            current = state;
            runs += 1;
        }
        run_start = idx;
    }

    dialogue
}
