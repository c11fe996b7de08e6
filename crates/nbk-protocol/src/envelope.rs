use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use base64::Engine as _;
use serde_json::Value;
use uuid::Uuid;

use crate::command::{CommandType, KernelCommand};
use crate::error::ProtocolError;
use crate::event::{EventType, KernelEventPayload};
use crate::lock;
use crate::model::{KernelCommandEnvelopeModel, KernelEnvelopeModel, KernelEventEnvelopeModel};
use crate::routing_slip::{CommandRoutingSlip, EventRoutingSlip};

/// Live command envelope.
///
/// Cloning the handle shares the envelope: the routing slip, token and parent link are
/// the same for every clone. Use [`KernelCommandEnvelope::deep_clone`] for an
/// independent copy to hand across a transport boundary.
#[derive(Clone)]
pub struct KernelCommandEnvelope {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    command_type: CommandType,
    command: std::sync::Mutex<KernelCommand>,
    token: std::sync::Mutex<Option<String>>,
    parent: std::sync::Mutex<Option<KernelCommandEnvelope>>,
    routing_slip: std::sync::Mutex<CommandRoutingSlip>,
    child_ordinal: AtomicU64,
}

impl KernelCommandEnvelope {
    pub fn new(command_type: impl Into<CommandType>, command: KernelCommand) -> Self {
        Self::assemble(command_type.into(), command, None, CommandRoutingSlip::new())
    }

    fn assemble(
        command_type: CommandType,
        command: KernelCommand,
        token: Option<String>,
        routing_slip: CommandRoutingSlip,
    ) -> Self {
        Self {
            inner: Arc::new(CommandInner {
                command_type,
                command: std::sync::Mutex::new(command),
                token: std::sync::Mutex::new(token),
                parent: std::sync::Mutex::new(None),
                routing_slip: std::sync::Mutex::new(routing_slip),
                child_ordinal: AtomicU64::new(0),
            }),
        }
    }

    pub fn command_type(&self) -> &CommandType {
        &self.inner.command_type
    }

    /// Snapshot of the payload.
    pub fn command(&self) -> KernelCommand {
        lock(&self.inner.command).clone()
    }

    pub fn update_command<R>(&self, f: impl FnOnce(&mut KernelCommand) -> R) -> R {
        f(&mut lock(&self.inner.command))
    }

    pub fn target_kernel_name(&self) -> Option<String> {
        lock(&self.inner.command).target_kernel_name.clone()
    }

    pub fn destination_uri(&self) -> Option<String> {
        lock(&self.inner.command).destination_uri.clone()
    }

    pub fn origin_uri(&self) -> Option<String> {
        lock(&self.inner.command).origin_uri.clone()
    }

    /// Locks the routing slip. Do not hold the guard across an `.await`.
    pub fn routing_slip(&self) -> MutexGuard<'_, CommandRoutingSlip> {
        lock(&self.inner.routing_slip)
    }

    /// Returns the token, allocating one on first use. A parented command derives its
    /// token from the parent; a root command gets a random 128-bit identifier.
    pub fn get_or_create_token(&self) -> String {
        if let Some(existing) = self.peek_token() {
            return existing;
        }
        let parent = self.parent();
        let mut token = lock(&self.inner.token);
        if let Some(existing) = token.as_ref() {
            return existing.clone();
        }
        let created = match parent {
            Some(parent) => parent.next_child_token(),
            None => new_root_token(),
        };
        *token = Some(created.clone());
        created
    }

    /// Returns the token without allocating one.
    pub fn token(&self) -> Result<String, ProtocolError> {
        self.peek_token()
            .ok_or_else(|| ProtocolError::MissingToken(self.inner.command_type.to_string()))
    }

    pub fn has_token(&self) -> bool {
        lock(&self.inner.token).is_some()
    }

    fn peek_token(&self) -> Option<String> {
        lock(&self.inner.token).clone()
    }

    fn next_child_token(&self) -> String {
        let ordinal = self.inner.child_ordinal.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}.{}", self.get_or_create_token(), ordinal)
    }

    pub fn parent(&self) -> Option<KernelCommandEnvelope> {
        lock(&self.inner.parent).clone()
    }

    /// Links this command under `parent`, allocating a child token if this command has
    /// none yet. Setting the same parent twice is a no-op.
    pub fn set_parent(&self, parent: &KernelCommandEnvelope) -> Result<(), ProtocolError> {
        if parent.has_ancestor_or_self(self) {
            return Err(ProtocolError::ParentConflict);
        }
        let mut slot = lock(&self.inner.parent);
        if let Some(existing) = slot.as_ref() {
            if Self::are_commands_the_same(existing, parent) {
                return Ok(());
            }
            return Err(ProtocolError::ParentConflict);
        }

        let mut token = lock(&self.inner.token);
        if let (Some(mine), Some(theirs)) = (token.as_deref(), parent.peek_token()) {
            if root_segment(mine) != root_segment(&theirs) {
                return Err(ProtocolError::RootTokenMismatch);
            }
        }
        if token.is_none() {
            *token = Some(parent.next_child_token());
        }
        *slot = Some(parent.clone());
        Ok(())
    }

    fn has_ancestor_or_self(&self, other: &KernelCommandEnvelope) -> bool {
        let mut current = Some(self.clone());
        while let Some(envelope) = current {
            if Arc::ptr_eq(&envelope.inner, &other.inner) {
                return true;
            }
            current = envelope.parent();
        }
        false
    }

    /// Identity comparison: the same handle, or the same command type with equal tokens.
    /// Untokenized envelopes only equal themselves.
    pub fn are_commands_the_same(a: &KernelCommandEnvelope, b: &KernelCommandEnvelope) -> bool {
        if Arc::ptr_eq(&a.inner, &b.inner) {
            return true;
        }
        if a.command_type() != b.command_type() {
            return false;
        }
        match (a.peek_token(), b.peek_token()) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }

    pub fn is_self_or_descendant_of(
        &self,
        other: &KernelCommandEnvelope,
    ) -> Result<bool, ProtocolError> {
        let mine = self.token()?;
        let theirs = other.token()?;
        Ok(mine == theirs || mine.starts_with(&format!("{theirs}.")))
    }

    pub fn has_same_root_command_as(
        &self,
        other: &KernelCommandEnvelope,
    ) -> Result<bool, ProtocolError> {
        let mine = self.token()?;
        let theirs = other.token()?;
        Ok(root_segment(&mine) == root_segment(&theirs))
    }

    /// Wire form. Forces token allocation so the receiving side can correlate events.
    pub fn to_model(&self) -> KernelCommandEnvelopeModel {
        KernelCommandEnvelopeModel {
            token: Some(self.get_or_create_token()),
            command_type: self.inner.command_type.clone(),
            command: self.command(),
            routing_slip: Some(self.routing_slip().to_vec()),
        }
    }

    pub fn from_model(model: KernelCommandEnvelopeModel) -> Result<Self, ProtocolError> {
        let routing_slip = match model.routing_slip {
            Some(uris) => CommandRoutingSlip::from_uris(&uris)?,
            None => CommandRoutingSlip::new(),
        };
        Ok(Self::assemble(
            model.command_type,
            model.command,
            model.token,
            routing_slip,
        ))
    }

    /// Independent copy with its own routing slip and no parent link, equivalent to a
    /// round trip through the wire form.
    pub fn deep_clone(&self) -> Self {
        let token = self.get_or_create_token();
        let routing_slip = CommandRoutingSlip::from_trusted(self.routing_slip().to_vec());
        Self::assemble(
            self.inner.command_type.clone(),
            self.command(),
            Some(token),
            routing_slip,
        )
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_model())?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Self::from_model(serde_json::from_str(json)?)
    }
}

impl fmt::Debug for KernelCommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCommandEnvelope")
            .field("command_type", &self.inner.command_type)
            .field("token", &self.peek_token())
            .field("routing_slip", &*self.routing_slip())
            .finish()
    }
}

fn new_root_token() -> String {
    base64::prelude::BASE64_STANDARD.encode(Uuid::new_v4().as_bytes())
}

fn root_segment(token: &str) -> &str {
    token.split('.').next().unwrap_or(token)
}

/// Live event envelope. Like [`KernelCommandEnvelope`], clones share state.
#[derive(Clone)]
pub struct KernelEventEnvelope {
    inner: Arc<EventInner>,
}

struct EventInner {
    event_type: EventType,
    event: Value,
    command: std::sync::Mutex<Option<KernelCommandEnvelope>>,
    routing_slip: std::sync::Mutex<EventRoutingSlip>,
}

impl KernelEventEnvelope {
    pub fn new(
        event_type: impl Into<EventType>,
        event: Value,
        command: Option<KernelCommandEnvelope>,
    ) -> Self {
        Self::assemble(event_type.into(), event, command, EventRoutingSlip::new())
    }

    pub fn from_payload<T: KernelEventPayload>(
        payload: &T,
        command: Option<KernelCommandEnvelope>,
    ) -> Self {
        Self::new(T::EVENT_TYPE, payload.to_value(), command)
    }

    fn assemble(
        event_type: EventType,
        event: Value,
        command: Option<KernelCommandEnvelope>,
        routing_slip: EventRoutingSlip,
    ) -> Self {
        Self {
            inner: Arc::new(EventInner {
                event_type,
                event,
                command: std::sync::Mutex::new(command),
                routing_slip: std::sync::Mutex::new(routing_slip),
            }),
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.inner.event_type
    }

    pub fn event(&self) -> &Value {
        &self.inner.event
    }

    pub fn is<T: KernelEventPayload>(&self) -> bool {
        self.inner.event_type == T::EVENT_TYPE
    }

    /// Decodes the payload as `T`. Fails when the event type does not match.
    pub fn payload<T: KernelEventPayload>(&self) -> Result<T, ProtocolError> {
        if !self.is::<T>() {
            return Err(ProtocolError::Payload {
                event_type: self.inner.event_type.to_string(),
                message: format!("expected {}", T::EVENT_TYPE),
            });
        }
        serde_json::from_value(self.inner.event.clone()).map_err(|err| ProtocolError::Payload {
            event_type: self.inner.event_type.to_string(),
            message: err.to_string(),
        })
    }

    pub fn command(&self) -> Option<KernelCommandEnvelope> {
        lock(&self.inner.command).clone()
    }

    pub fn set_command(&self, command: KernelCommandEnvelope) {
        *lock(&self.inner.command) = Some(command);
    }

    /// Sets the producing command only when none is attached yet.
    pub fn set_command_if_absent(&self, command: &KernelCommandEnvelope) {
        let mut slot = lock(&self.inner.command);
        if slot.is_none() {
            *slot = Some(command.clone());
        }
    }

    /// Locks the routing slip. Do not hold the guard across an `.await`.
    pub fn routing_slip(&self) -> MutexGuard<'_, EventRoutingSlip> {
        lock(&self.inner.routing_slip)
    }

    pub fn to_model(&self) -> KernelEventEnvelopeModel {
        KernelEventEnvelopeModel {
            event_type: self.inner.event_type.clone(),
            event: self.inner.event.clone(),
            command: self.command().map(|command| command.to_model()),
            routing_slip: Some(self.routing_slip().to_vec()),
        }
    }

    pub fn from_model(model: KernelEventEnvelopeModel) -> Result<Self, ProtocolError> {
        let command = model
            .command
            .map(KernelCommandEnvelope::from_model)
            .transpose()?;
        let routing_slip = match model.routing_slip {
            Some(uris) => EventRoutingSlip::from_uris(&uris)?,
            None => EventRoutingSlip::new(),
        };
        Ok(Self::assemble(
            model.event_type,
            model.event,
            command,
            routing_slip,
        ))
    }

    pub fn deep_clone(&self) -> Self {
        let routing_slip = EventRoutingSlip::from_trusted(self.routing_slip().to_vec());
        Self::assemble(
            self.inner.event_type.clone(),
            self.inner.event.clone(),
            self.command().map(|command| command.deep_clone()),
            routing_slip,
        )
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_model())?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Self::from_model(serde_json::from_str(json)?)
    }
}

impl fmt::Debug for KernelEventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEventEnvelope")
            .field("event_type", &self.inner.event_type)
            .field("event", &self.inner.event)
            .field("command", &self.command())
            .field("routing_slip", &*self.routing_slip())
            .finish()
    }
}

/// Anything that travels over a transport.
#[derive(Clone, Debug)]
pub enum KernelEnvelope {
    Command(KernelCommandEnvelope),
    Event(KernelEventEnvelope),
}

impl KernelEnvelope {
    pub fn to_model(&self) -> KernelEnvelopeModel {
        match self {
            KernelEnvelope::Command(command) => KernelEnvelopeModel::Command(command.to_model()),
            KernelEnvelope::Event(event) => KernelEnvelopeModel::Event(event.to_model()),
        }
    }

    pub fn from_model(model: KernelEnvelopeModel) -> Result<Self, ProtocolError> {
        Ok(match model {
            KernelEnvelopeModel::Command(command) => {
                KernelEnvelope::Command(KernelCommandEnvelope::from_model(command)?)
            }
            KernelEnvelopeModel::Event(event) => {
                KernelEnvelope::Event(KernelEventEnvelope::from_model(event)?)
            }
        })
    }

    pub fn deep_clone(&self) -> Self {
        match self {
            KernelEnvelope::Command(command) => KernelEnvelope::Command(command.deep_clone()),
            KernelEnvelope::Event(event) => KernelEnvelope::Event(event.deep_clone()),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_model())?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Self::from_model(serde_json::from_str(json)?)
    }
}

impl From<KernelCommandEnvelope> for KernelEnvelope {
    fn from(value: KernelCommandEnvelope) -> Self {
        KernelEnvelope::Command(value)
    }
}

impl From<KernelEventEnvelope> for KernelEnvelope {
    fn from(value: KernelEventEnvelope) -> Self {
        KernelEnvelope::Event(value)
    }
}
