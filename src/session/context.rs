use super::model::Session;
use super::serializer::SerializationMetadata;

/// Per-request session cache.
///
/// Built at request entry, handed to every store call of that request and
/// consumed by the store's after-request hook; it is never reused. Holds at
/// most one session.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub(crate) session: Option<Session>,
    pub(crate) session_id: Option<String>,
    pub(crate) metadata: Option<SerializationMetadata>,
    /// The session's current state is known to be in the store
    pub(crate) persisted: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn metadata(&self) -> Option<&SerializationMetadata> {
        self.metadata.as_ref()
    }

    pub fn clear(&mut self) {
        self.session = None;
        self.session_id = None;
        self.metadata = None;
        self.persisted = false;
    }

    /// Make `session` the request's active session, replacing any other.
    pub(crate) fn bind(
        &mut self,
        session: Session,
        metadata: SerializationMetadata,
        persisted: bool,
    ) -> &mut Session {
        self.session_id = Some(session.id().to_string());
        self.metadata = Some(metadata);
        self.persisted = persisted;
        self.session.insert(session)
    }

    /// Detach the session, leaving the context empty.
    pub fn take_session(&mut self) -> Option<Session> {
        let session = self.session.take();
        self.clear();
        session
    }
}
