//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use floe_rpc::{
    CloseMode, Communicator, Current, Encapsulation, Error, Identity, ObjectAdapter, ObjectPrx, Properties, Result,
    Servant, TypedProxy, UserException,
};

pub const HELLO_TYPE_ID: &str = "::Test::Hello";

/// Fast retries so failure paths finish quickly.
pub fn client_properties() -> Properties {
    let mut properties = Properties::new();
    properties.set("Floe.Retry.MaxRetries", "2");
    properties.set("Floe.Retry.InitialBackoff", "1");
    properties.set("Floe.Retry.MaxBackoff", "10");
    properties
}

pub fn client() -> Communicator {
    Communicator::with_properties(client_properties()).unwrap()
}

/// Raised by `Hello::fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloError {
    pub reason: String,
}

impl UserException for HelloError {
    fn ice_id(&self) -> &str {
        "::Test::HelloError"
    }

    fn write_slices(&self, out: &mut floe_rpc::OutputStream) {
        out.start_slice("::Test::HelloError", None, true);
        out.write_string(&self.reason);
        out.end_slice();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register_hello_error(communicator: &Communicator) {
    communicator
        .exception_factories()
        .add("::Test::HelloError", |input| {
            input.start_slice()?;
            let reason = input.read_string()?;
            input.end_slice()?;
            Ok(Arc::new(HelloError { reason }) as Arc<dyn UserException>)
        })
        .unwrap();
}

/// Test servant: greets, records oneway messages, sleeps, fails and closes
/// its connection on request.
#[derive(Default)]
pub struct Hello {
    pub recorded: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl Hello {
    /// How many times `operation` was dispatched.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Servant for Hello {
    fn ice_id(&self) -> String {
        HELLO_TYPE_ID.to_string()
    }

    async fn dispatch(&self, current: &Current, params: Encapsulation) -> Result<Encapsulation> {
        *self.calls.lock().unwrap().entry(current.operation.clone()).or_default() += 1;
        let mut input = current.reader(&params);
        match current.operation.as_str() {
            "sayHello" => {
                let name = input.read_string()?;
                current.ok(|out| out.write_string(&format!("Hello, {name}!")))
            }
            "record" => {
                let item = input.read_string()?;
                self.recorded.lock().unwrap().push(item);
                Ok(current.empty())
            }
            "recorded" => {
                let items = self.recorded.lock().unwrap().clone();
                current.ok(|out| out.write_string_seq(&items))
            }
            "sleep" => {
                let ms = input.read_int()?;
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(current.empty())
            }
            "fail" => Err(Error::User(Arc::new(HelloError {
                reason: input.read_string()?,
            }))),
            "closeAndSleep" => {
                let ms = input.read_int()?;
                if let Some(connection) = current.connection.clone() {
                    tokio::spawn(async move { connection.close(CloseMode::Gracefully).await });
                }
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(current.empty())
            }
            "dropConnection" => {
                if let Some(connection) = &current.connection {
                    connection.close(CloseMode::Forcefully).await;
                }
                Ok(current.empty())
            }
            _ => Err(Error::OperationNotExist {
                identity: current.id.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            }),
        }
    }
}

/// Typed proxy for [`Hello`].
#[derive(Debug, Clone, PartialEq)]
pub struct HelloPrx(pub ObjectPrx);

impl TypedProxy for HelloPrx {
    fn static_id() -> &'static str {
        HELLO_TYPE_ID
    }

    fn from_proxy(proxy: ObjectPrx) -> Self {
        HelloPrx(proxy)
    }

    fn as_proxy(&self) -> &ObjectPrx {
        &self.0
    }
}

impl HelloPrx {
    pub async fn say_hello(&self, name: &str) -> Result<String> {
        self.0
            .invoke_typed(
                "sayHello",
                floe_rpc::OperationMode::Normal,
                |out| out.write_string(name),
                |input| input.read_string(),
            )
            .await
    }

    pub async fn record(&self, item: &str) -> Result<()> {
        self.0
            .invoke_typed(
                "record",
                floe_rpc::OperationMode::Normal,
                |out| out.write_string(item),
                |_| Ok(()),
            )
            .await
    }

    pub async fn recorded(&self) -> Result<Vec<String>> {
        self.0
            .invoke_typed(
                "recorded",
                floe_rpc::OperationMode::Nonmutating,
                |_| {},
                |input| input.read_string_seq(),
            )
            .await
    }

    /// Starts a graceful close of the connection the call arrived on, then
    /// sleeps for `ms`.
    pub async fn close_and_sleep(&self, ms: i32) -> Result<()> {
        self.0
            .invoke_typed(
                "closeAndSleep",
                floe_rpc::OperationMode::Normal,
                |out| out.write_int(ms),
                |_| Ok(()),
            )
            .await
    }

    /// Drops the connection the call arrived on before replying.
    pub async fn drop_connection(&self) -> Result<()> {
        self.0
            .invoke_typed(
                "dropConnection",
                floe_rpc::OperationMode::Normal,
                |_| {},
                |_| Ok(()),
            )
            .await
    }

    pub async fn fail(&self, reason: &str) -> Result<()> {
        self.0
            .invoke_typed(
                "fail",
                floe_rpc::OperationMode::Normal,
                |out| out.write_string(reason),
                |_| Ok(()),
            )
            .await
    }
}

/// A proxy type the test servant does not implement.
#[derive(Debug, Clone)]
pub struct OtherPrx(pub ObjectPrx);

impl TypedProxy for OtherPrx {
    fn static_id() -> &'static str {
        "::Test::Other"
    }

    fn from_proxy(proxy: ObjectPrx) -> Self {
        OtherPrx(proxy)
    }

    fn as_proxy(&self) -> &ObjectPrx {
        &self.0
    }
}

/// An in-process server with one activated adapter.
pub struct TestServer {
    pub communicator: Communicator,
    pub adapter: ObjectAdapter,
    pub hello: Arc<Hello>,
}

impl TestServer {
    /// Serves a [`Hello`] as `identity` on `endpoints`.
    pub async fn start(endpoints: &str, identity: &str) -> Self {
        Self::start_with(Properties::new(), endpoints, identity).await
    }

    /// Like [`TestServer::start`], with a configured server communicator.
    pub async fn start_with(properties: Properties, endpoints: &str, identity: &str) -> Self {
        let communicator = Communicator::with_properties(properties).unwrap();
        let adapter = communicator
            .create_object_adapter_with_endpoints("TestAdapter", endpoints)
            .unwrap();
        let hello = Arc::new(Hello::default());
        adapter.add(hello.clone(), Identity::new(identity)).unwrap();
        adapter.activate().await.unwrap();
        TestServer {
            communicator,
            adapter,
            hello,
        }
    }

    /// The bound endpoints, stringified for a proxy.
    pub fn endpoints(&self) -> String {
        self.adapter
            .published_endpoints()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn proxy_string(&self, identity: &str) -> String {
        format!("{identity}:{}", self.endpoints())
    }

    pub async fn shutdown(&self) {
        self.communicator.destroy().await;
    }
}
