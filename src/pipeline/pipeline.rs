use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::trace;
use crate::error::{TransportError, TransportResult};
use crate::pipeline::handler::{ChannelHandler, ChannelInfo, SharableHandler, SharedHandler};
use crate::pipeline::session::PipelineSession;

/// How a pipeline entry turns into a handler of a concrete session
#[derive(Clone)]
pub enum HandlerEntry {
    /// the same instance for all sessions
    Shared(Arc<dyn SharableHandler>),
    /// a fresh instance per session
    PerChannel(Arc<dyn Fn() -> Box<dyn ChannelHandler> + Send + Sync>),
}

impl HandlerEntry {
    pub fn shared(handler: impl SharableHandler) -> HandlerEntry {
        HandlerEntry::Shared(Arc::new(handler))
    }

    pub fn per_channel<H: ChannelHandler + 'static>(factory: impl Fn() -> H + Send + Sync + 'static) -> HandlerEntry {
        HandlerEntry::PerChannel(Arc::new(move || Box::new(factory())))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, HandlerEntry::Shared(_))
    }

    pub(crate) fn instantiate(&self) -> Box<dyn ChannelHandler> {
        match self {
            HandlerEntry::Shared(handler) => Box::new(SharedHandler(handler.clone())),
            HandlerEntry::PerChannel(factory) => factory(),
        }
    }
}

impl Debug for HandlerEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerEntry::Shared(_) => write!(f, "Shared"),
            HandlerEntry::PerChannel(_) => write!(f, "PerChannel"),
        }
    }
}

/// An ordered list of uniquely named handler entries. This is a template: it holds no
///  traversal state and is cheap to clone, so one pipeline can back any number of channels.
#[derive(Clone, Default)]
pub struct Pipeline {
    entries: Vec<(String, HandlerEntry)>,
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pipeline{:?}", self.names())
    }
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&HandlerEntry> {
        self.entries.iter()
            .find(|(n, _)| n == name)
            .map(|(_, entry)| entry)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    fn check_unique(&self, name: &str) -> TransportResult<()> {
        if self.contains(name) {
            return Err(TransportError::DuplicateHandlerName(name.to_string()));
        }
        Ok(())
    }

    fn existing(&self, name: &str) -> TransportResult<usize> {
        self.position(name)
            .ok_or_else(|| TransportError::HandlerNotFound(name.to_string()))
    }

    pub fn add_first(&mut self, name: &str, entry: HandlerEntry) -> TransportResult<&mut Pipeline> {
        self.check_unique(name)?;
        self.entries.insert(0, (name.to_string(), entry));
        Ok(self)
    }

    pub fn add_last(&mut self, name: &str, entry: HandlerEntry) -> TransportResult<&mut Pipeline> {
        self.check_unique(name)?;
        self.entries.push((name.to_string(), entry));
        Ok(self)
    }

    pub fn add_before(&mut self, base_name: &str, name: &str, entry: HandlerEntry) -> TransportResult<&mut Pipeline> {
        let idx = self.existing(base_name)?;
        self.check_unique(name)?;
        self.entries.insert(idx, (name.to_string(), entry));
        Ok(self)
    }

    pub fn add_after(&mut self, base_name: &str, name: &str, entry: HandlerEntry) -> TransportResult<&mut Pipeline> {
        let idx = self.existing(base_name)?;
        self.check_unique(name)?;
        self.entries.insert(idx + 1, (name.to_string(), entry));
        Ok(self)
    }

    /// Replace the entry named `old_name`, keeping its position. The new name must be unique
    ///  unless it is the old name.
    pub fn replace(&mut self, old_name: &str, new_name: &str, entry: HandlerEntry) -> TransportResult<HandlerEntry> {
        let idx = self.existing(old_name)?;
        if old_name != new_name {
            self.check_unique(new_name)?;
        }
        let (_, previous) = std::mem::replace(&mut self.entries[idx], (new_name.to_string(), entry));
        Ok(previous)
    }

    pub fn remove(&mut self, name: &str) -> TransportResult<HandlerEntry> {
        let idx = self.existing(name)?;
        Ok(self.entries.remove(idx).1)
    }

    /// Instantiate the pipeline for a channel: per-channel handlers are created fresh, shared
    ///  handlers are referenced
    pub fn session(&self, info: ChannelInfo) -> PipelineSession {
        trace!("creating pipeline session for channel {} with handlers {:?}", info.id, self.names());
        let handlers = self.entries.iter()
            .map(|(name, entry)| (name.clone(), entry.instantiate()))
            .collect();
        PipelineSession::new(handlers, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler::{HandlerDirection, Payload};
    use bytes::Bytes;
    use crate::test_util::{channel_info, PassThrough, Recorder, Recording};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(names: &[&str]) -> Pipeline {
        let mut result = Pipeline::new();
        for name in names {
            result.add_last(name, HandlerEntry::shared(PassThrough(HandlerDirection::Both))).unwrap();
        }
        result
    }

    fn entry() -> HandlerEntry {
        HandlerEntry::shared(PassThrough(HandlerDirection::Inbound))
    }

    #[rstest]
    #[case::first_empty(vec![], "x", vec!["x"])]
    #[case::first(vec!["a", "b"], "x", vec!["x", "a", "b"])]
    fn test_add_first(#[case] initial: Vec<&str>, #[case] name: &str, #[case] expected: Vec<&str>) {
        let mut p = pipeline(&initial);
        p.add_first(name, entry()).unwrap();
        assert_eq!(p.names(), expected);
    }

    #[rstest]
    #[case::before_first("a", vec!["x", "a", "b", "c"])]
    #[case::before_middle("b", vec!["a", "x", "b", "c"])]
    #[case::before_last("c", vec!["a", "b", "x", "c"])]
    fn test_add_before(#[case] base: &str, #[case] expected: Vec<&str>) {
        let mut p = pipeline(&["a", "b", "c"]);
        p.add_before(base, "x", entry()).unwrap();
        assert_eq!(p.names(), expected);
    }

    #[rstest]
    #[case::after_first("a", vec!["a", "x", "b"])]
    #[case::after_last("b", vec!["a", "b", "x"])]
    fn test_add_after(#[case] base: &str, #[case] expected: Vec<&str>) {
        let mut p = pipeline(&["a", "b"]);
        p.add_after(base, "x", entry()).unwrap();
        assert_eq!(p.names(), expected);
    }

    #[rstest]
    #[case::add_first(|p: &mut Pipeline| p.add_first("b", entry()).map(|_| ()))]
    #[case::add_last(|p: &mut Pipeline| p.add_last("a", entry()).map(|_| ()))]
    #[case::add_before(|p: &mut Pipeline| p.add_before("b", "a", entry()).map(|_| ()))]
    #[case::add_after(|p: &mut Pipeline| p.add_after("a", "b", entry()).map(|_| ()))]
    #[case::replace(|p: &mut Pipeline| p.replace("a", "b", entry()).map(|_| ()))]
    fn test_duplicate_name(#[case] op: fn(&mut Pipeline) -> TransportResult<()>) {
        let mut p = pipeline(&["a", "b"]);
        assert!(matches!(op(&mut p), Err(TransportError::DuplicateHandlerName(_))));
        assert_eq!(p.names(), vec!["a", "b"]);
    }

    #[rstest]
    #[case::add_before(|p: &mut Pipeline| p.add_before("z", "x", entry()).map(|_| ()))]
    #[case::add_after(|p: &mut Pipeline| p.add_after("z", "x", entry()).map(|_| ()))]
    #[case::replace(|p: &mut Pipeline| p.replace("z", "x", entry()).map(|_| ()))]
    #[case::remove(|p: &mut Pipeline| p.remove("z").map(|_| ()))]
    fn test_handler_not_found(#[case] op: fn(&mut Pipeline) -> TransportResult<()>) {
        let mut p = pipeline(&["a", "b"]);
        assert!(matches!(op(&mut p), Err(TransportError::HandlerNotFound(_))));
        assert_eq!(p.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_replace() {
        let mut p = pipeline(&["a", "b", "c"]);
        p.replace("b", "b", entry()).unwrap();
        p.replace("c", "x", entry()).unwrap();
        assert_eq!(p.names(), vec!["a", "b", "x"]);
        assert!(!p.contains("c"));
    }

    #[test]
    fn test_remove() {
        let mut p = pipeline(&["a", "b", "c"]);
        assert!(p.remove("b").unwrap().is_shared());
        assert_eq!(p.names(), vec!["a", "c"]);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_per_channel_instantiation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();

        let shared = Arc::new(PassThrough(HandlerDirection::Both));
        let mut p = Pipeline::new();
        p.add_last("shared", HandlerEntry::Shared(shared.clone())).unwrap();
        let log = Recording::default();
        let log2 = log.clone();
        p.add_last("per-channel", HandlerEntry::per_channel(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            Recorder::new("per-channel", HandlerDirection::Both, log2.clone())
        })).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let mut s1 = p.session(channel_info());
        let _s2 = p.session(channel_info());
        let _s3 = p.clone().session(channel_info());

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        s1.fire_read(Payload::Bytes { data: Bytes::from_static(b"x"), remote: None });
        assert_eq!(log.entries(), vec!["per-channel:read".to_string()]);
        // one reference in the test, one in the pipeline, one per session
        assert_eq!(Arc::strong_count(&shared), 5);
    }
}
