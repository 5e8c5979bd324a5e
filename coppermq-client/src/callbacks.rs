use crate::connection::Connection;
use coppermq_codec::frame::AMQPFrame;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Asynchronous connection lifecycle hook. Hooks get a cloned connection
/// handle, so they can open channels or queue operations. They run on the
/// event loop task: use the fire and forget operations inside and avoid
/// awaiting synchronous confirmations, those would block the loop.
pub type ConnectionHook =
    Arc<dyn Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Synchronous per-frame hook, fired right before a frame hits the socket.
pub type FrameSentHook = Arc<dyn Fn(&AMQPFrame) + Send + Sync>;

/// Hook fired when the broker closes a channel, with a readable reason.
pub type ChannelCloseHook = Box<dyn FnMut(String) + Send>;

/// Subscriber lists for the connection level events.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    startup: Mutex<Vec<ConnectionHook>>,
    reconnected: Mutex<Vec<ConnectionHook>>,
    disconnected: Mutex<Vec<ConnectionHook>>,
    frame_sent: Mutex<Vec<FrameSentHook>>,
}

impl CallbackRegistry {
    pub(crate) fn add_startup(&self, hook: ConnectionHook) {
        self.startup.lock().unwrap().push(hook);
    }

    pub(crate) fn add_reconnected(&self, hook: ConnectionHook) {
        self.reconnected.lock().unwrap().push(hook);
    }

    pub(crate) fn add_disconnected(&self, hook: ConnectionHook) {
        self.disconnected.lock().unwrap().push(hook);
    }

    pub(crate) fn add_frame_sent(&self, hook: FrameSentHook) {
        self.frame_sent.lock().unwrap().push(hook);
    }

    pub(crate) fn startup_hooks(&self) -> Vec<ConnectionHook> {
        self.startup.lock().unwrap().clone()
    }

    pub(crate) fn reconnected_hooks(&self) -> Vec<ConnectionHook> {
        self.reconnected.lock().unwrap().clone()
    }

    pub(crate) fn disconnected_hooks(&self) -> Vec<ConnectionHook> {
        self.disconnected.lock().unwrap().clone()
    }

    pub(crate) fn frame_sent(&self, frame: &AMQPFrame) {
        for hook in self.frame_sent.lock().unwrap().iter() {
            hook(frame);
        }
    }
}

/// Invoke a hook list one by one with a fresh handle clone.
pub(crate) async fn fire(hooks: Vec<ConnectionHook>, conn: &Connection) {
    for hook in hooks {
        hook(conn.clone()).await;
    }
}

/// Wrap an async closure into the stored hook shape.
pub(crate) fn connection_hook<F, Fut>(hook: F) -> ConnectionHook
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn| Box::pin(hook(conn)))
}
