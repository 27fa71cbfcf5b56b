//! Multicast DNS service discovery and publishing (DNS-SD over mDNS).
//!
//! Watch for services of a type, publish local services with probing and
//! conflict renaming, and stream discovery events to the caller.

#[macro_use]
extern crate lazy_static;

mod cache;
mod debug;
mod dns;
mod engine;
mod query;
mod responder;
mod service;
mod socket;
mod zeroconf_error;

pub use service::{ DiscoveryAction, DiscoveryEvent, ServiceRecord, ServiceType, WatchId };
pub use zeroconf_error::ZeroConfError;

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;
use log::warn;

use engine::NativeEngine;

// The engine behind the facade, picked once at startup: native sockets where
// the environment allows raw multicast, otherwise a stub that refuses every
// operation.
enum Backend
{
    Native(NativeEngine),
    Unavailable
}

pub struct ZeroConf
{
    backend: Backend,
    events: mpsc::Receiver<DiscoveryEvent>
}

impl ZeroConf
{
    /// Open the multicast transport and start the engine. An environment
    /// that cannot do raw multicast at all yields a facade whose operations
    /// fail with `NotAvailable`; having no usable interface is an error
    /// here.
    pub fn new() -> Result<ZeroConf, ZeroConfError>
    {
        let (sender, receiver) = mpsc::channel();

        match NativeEngine::open(sender)
        {
            Ok(engine) =>
            {
                Ok(ZeroConf
                {
                    backend: Backend::Native(engine),
                    events: receiver
                })
            },
            Err(ZeroConfError::NotAvailable) =>
            {
                warn!("Raw multicast is not available, all operations will fail");
                Ok(ZeroConf
                {
                    backend: Backend::Unavailable,
                    events: receiver
                })
            },
            Err(err) =>
            {
                Err(err)
            }
        }
    }

    /// Start discovery for a service type. Results stream through the event
    /// channel; the returned id is an opaque session handle.
    pub fn watch(&self, type_name: &str, domain: &str) -> Result<WatchId, ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) => engine.watch(ServiceType::new(type_name, domain)?),
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Stop discovery for a service type.
    pub fn unwatch(&self, type_name: &str, domain: &str) -> Result<(), ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) => engine.unwatch(&ServiceType::new(type_name, domain)?),
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Publish a service. Blocks through the probe window and returns the
    /// name actually registered, which differs from the requested one when a
    /// conflict forced a rename.
    pub fn register(
        &self,
        type_name: &str,
        domain: &str,
        name: &str,
        port: u16,
        props: &HashMap<String, String>
    ) -> Result<String, ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) =>
            {
                engine.register(&ServiceType::new(type_name, domain)?, name, port, props)
            },
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Withdraw one published service.
    pub fn unregister(&self, type_name: &str, domain: &str, name: &str) -> Result<(), ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) =>
            {
                engine.unregister(&ServiceType::new(type_name, domain)?, name)
            },
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Withdraw every published service; watches keep running.
    pub fn stop(&self) -> Result<(), ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) => engine.stop(),
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Withdraw everything, end all watches and release the transport.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<(), ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) => engine.close(),
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// The local mDNS hostname, independent of discovery state.
    pub fn get_hostname(&self) -> Result<String, ZeroConfError>
    {
        match &self.backend
        {
            Backend::Native(engine) => Ok(engine.hostname().to_string()),
            Backend::Unavailable => Err(ZeroConfError::NotAvailable)
        }
    }

    /// Next discovery event, if one is already queued.
    pub fn try_recv_event(&self) -> Option<DiscoveryEvent>
    {
        self.events.try_recv().ok()
    }

    /// Wait up to `timeout` for the next discovery event.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<DiscoveryEvent>
    {
        self.events.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn unavailable() -> ZeroConf
    {
        let (_sender, receiver) = mpsc::channel();
        ZeroConf
        {
            backend: Backend::Unavailable,
            events: receiver
        }
    }

    #[test]
    fn test_unavailable_backend_fails_every_operation()
    {
        let zeroconf = unavailable();

        assert_eq!(zeroconf.watch("_http._tcp.", "local.").unwrap_err(), ZeroConfError::NotAvailable);
        assert_eq!(zeroconf.unwatch("_http._tcp.", "local.").unwrap_err(), ZeroConfError::NotAvailable);
        assert_eq!(
            zeroconf.register("_http._tcp.", "local.", "srv", 8080, &HashMap::new()).unwrap_err(),
            ZeroConfError::NotAvailable
        );
        assert_eq!(
            zeroconf.unregister("_http._tcp.", "local.", "srv").unwrap_err(),
            ZeroConfError::NotAvailable
        );
        assert_eq!(zeroconf.stop().unwrap_err(), ZeroConfError::NotAvailable);
        assert_eq!(zeroconf.close().unwrap_err(), ZeroConfError::NotAvailable);
        assert_eq!(zeroconf.get_hostname().unwrap_err(), ZeroConfError::NotAvailable);
    }

    #[test]
    fn test_unavailable_backend_delivers_no_events()
    {
        let zeroconf = unavailable();
        assert!(zeroconf.try_recv_event().is_none());
    }
}
