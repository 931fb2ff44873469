use std::fmt;
use std::marker::PhantomData;

/// Whether a recipient type is sharded or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    /// One instance per entity id, hosted by the owner of its shard.
    Entity,
    /// Broadcast target: one instance per pod that has the topic registered.
    /// Delivery skips the shard ownership check.
    Topic,
}

/// A named recipient type accepting messages of type `Msg`.
///
/// The name identifies the type across pods; every pod registering or
/// messaging it must agree on `Msg`.
pub struct RecipientType<Msg> {
    name: String,
    kind: RecipientKind,
    _msg: PhantomData<fn() -> Msg>,
}

impl<Msg> RecipientType<Msg> {
    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(name, RecipientKind::Entity)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, RecipientKind::Topic)
    }

    fn new(name: impl Into<String>, kind: RecipientKind) -> Self {
        Self {
            name: name.into(),
            kind,
            _msg: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RecipientKind {
        self.kind
    }
}

impl<Msg> Clone for RecipientType<Msg> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone(), self.kind)
    }
}

impl<Msg> fmt::Debug for RecipientType<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipientType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<Msg> fmt::Display for RecipientType<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
