//! Doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use extend_wire::{FieldReader, FieldWriter, NativeSerializer, Serializer, Value, WireError};
use uuid::Uuid;

use crate::channel::{Channel, Subject};
use crate::connection::{Connection, ConnectionManager, Receiver};
use crate::control::messaging_factory;
use crate::error::ExtendError;
use crate::message::{Envelope, Message, Request, Response, FIRST_REQUEST_PROPERTY};
use crate::protocol::{MessageFactory, Protocol, ProtocolFactory};

pub(crate) const TEST_PROTOCOL: &str = "TestProtocol";
pub(crate) const TYPE_ECHO: i32 = 1;
pub(crate) const TYPE_NOTE: i32 = 2;

/// Echoes its payload; a payload of "fail" fails with `IllegalState`
#[derive(Debug, Default, Clone)]
pub(crate) struct EchoRequest {
    pub id: i64,
    pub payload: Value,
}

impl EchoRequest {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            id: 0,
            payload: payload.into(),
        }
    }
}

impl Message for EchoRequest {
    fn type_id(&self) -> i32 {
        TYPE_ECHO
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.payload = reader.read_object(FIRST_REQUEST_PROPERTY)?;
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_object(FIRST_REQUEST_PROPERTY, &self.payload)
    }
}

impl Request for EchoRequest {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn process(&self, _channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError> {
        if self.payload.as_str() == Some("fail") {
            return Err(ExtendError::IllegalState("boom".into()));
        }
        response.set_result(self.payload.clone());
        Ok(())
    }
}

/// One-way message that stores its text as the channel attribute "note"
#[derive(Debug, Default, Clone)]
pub(crate) struct Note {
    pub text: String,
}

impl Message for Note {
    fn type_id(&self) -> i32 {
        TYPE_NOTE
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.text = reader.read_string(0)?.unwrap_or_default();
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_string(0, Some(&self.text))
    }

    fn run(&self, channel: &Arc<Channel>) -> Result<(), ExtendError> {
        if self.text == "explode" {
            return Err(ExtendError::Protocol("unreadable note".into()));
        }
        channel.set_attribute("note", Value::from(self.text.as_str()));
        Ok(())
    }
}

/// Message that parks inside the channel until released
#[derive(Debug)]
pub(crate) struct Parked {
    pub entered: Arc<Barrier>,
    pub release: Arc<Barrier>,
}

impl Message for Parked {
    fn type_id(&self) -> i32 {
        TYPE_NOTE
    }

    fn run(&self, _channel: &Arc<Channel>) -> Result<(), ExtendError> {
        self.entered.wait();
        self.release.wait();
        Ok(())
    }
}

pub(crate) fn test_factory() -> Arc<dyn MessageFactory> {
    ProtocolFactory::builder(Protocol::new(TEST_PROTOCOL, 1, 1))
        .response(0)
        .request(TYPE_ECHO, || Box::<EchoRequest>::default())
        .message(TYPE_NOTE, || Box::<Note>::default())
        .build()
}

/// Receiver counting the channels it serves
#[derive(Debug, Default)]
pub(crate) struct CountingReceiver {
    pub registered: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Receiver for CountingReceiver {
    fn name(&self) -> &str {
        "Echo"
    }

    fn register_channel(&self, _channel: &Arc<Channel>) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_closed(&self, _channel: &Arc<Channel>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct TestManager {
    pub request_timeout: Option<Duration>,
    pub close_timeout: Duration,
    pub service_thread: AtomicBool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Default for TestManager {
    fn default() -> Self {
        Self {
            request_timeout: None,
            close_timeout: Duration::from_millis(20),
            service_thread: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }
}

impl ConnectionManager for TestManager {
    fn service_name(&self) -> &str {
        "TestService"
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    fn channel_close_timeout(&self) -> Duration {
        self.close_timeout
    }

    fn on_channel_opened(&self, _channel: &Arc<Channel>) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_closed(&self, _channel: &Arc<Channel>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_accepting_clients(&self) -> Result<(), ExtendError> {
        Ok(())
    }

    fn close_channel(&self, channel: &Arc<Channel>, notify: bool, cause: Option<ExtendError>) {
        let _ = channel.close(notify, cause);
    }

    fn is_service_thread(&self) -> bool {
        self.service_thread.load(Ordering::SeqCst)
    }
}

/// Connection that records what it is asked to post
#[derive(Debug)]
pub(crate) struct TestConnection {
    id: Uuid,
    me: Weak<TestConnection>,
    manager: Option<Arc<TestManager>>,
    channels: DashMap<i32, Arc<Channel>>,
    pub posted: Mutex<Vec<(i32, Envelope)>>,
    pub fail_posts: AtomicBool,
    close_on_exit: AtomicBool,
}

impl TestConnection {
    pub fn new(manager: Option<Arc<TestManager>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            me: me.clone(),
            manager,
            channels: DashMap::new(),
            posted: Mutex::new(Vec::new()),
            fail_posts: AtomicBool::new(false),
            close_on_exit: AtomicBool::new(false),
        })
    }

    pub fn open_channel_with(
        &self,
        id: i32,
        factory: Arc<dyn MessageFactory>,
        serializer: Arc<dyn Serializer>,
        receiver: Option<Arc<dyn Receiver>>,
    ) -> Arc<Channel> {
        let connection: Weak<dyn Connection> = self.me.clone();
        let channel = Channel::builder(id)
            .connection(connection)
            .factory(factory)
            .serializer(serializer)
            .receiver(receiver)
            .subject(Some(Subject::new("tester")))
            .build()
            .unwrap();
        self.channels.insert(id, channel.clone());
        channel.open().unwrap();
        channel
    }

    pub fn open_channel(&self, id: i32) -> Arc<Channel> {
        let factory = if id == 0 {
            messaging_factory(crate::control::MESSAGING_VERSION).unwrap()
        } else {
            test_factory()
        };
        self.open_channel_with(id, factory, Arc::new(NativeSerializer), None)
    }

    pub fn posted(&self) -> Vec<(i32, Envelope)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn last_response(&self) -> Arc<Response> {
        self.posted()
            .into_iter()
            .rev()
            .find_map(|(_, e)| match e {
                Envelope::Response(r) => Some(r),
                _ => None,
            })
            .unwrap()
    }
}

impl Connection for TestConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        true
    }

    fn channel(&self, id: i32) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|c| c.value().clone())
    }

    fn manager(&self) -> Option<Arc<dyn ConnectionManager>> {
        self.manager.clone().map(|m| m as Arc<dyn ConnectionManager>)
    }

    fn post(&self, channel: &Channel, message: &Envelope) -> Result<(), ExtendError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(ExtendError::Connection("transport down".into()));
        }
        self.posted.lock().unwrap().push((channel.id(), message.clone()));
        Ok(())
    }

    fn gate_enter(&self) -> Result<(), ExtendError> {
        Ok(())
    }

    fn gate_exit(&self) {}

    fn is_close_on_exit(&self) -> bool {
        self.close_on_exit.load(Ordering::SeqCst)
    }

    fn set_close_on_exit(&self, _notify: bool, _cause: Option<ExtendError>) {
        self.close_on_exit.store(true, Ordering::SeqCst);
    }

    fn unregister_channel(&self, channel: &Channel) {
        self.channels.remove(&channel.id());
    }

    fn accept_channel(
        &self,
        _protocol: &str,
        _receiver: Option<&str>,
        _subject: Option<Subject>,
    ) -> Result<i32, ExtendError> {
        Err(ExtendError::Unsupported("accept_channel".into()))
    }
}
