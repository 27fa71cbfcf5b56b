use std::collections::HashMap;
use std::time::Duration;

use log::{ info, error };
use libzeroconf::{ DiscoveryAction, ZeroConf };

fn main()
{
    env_logger::init();

    let zeroconf = match ZeroConf::new()
    {
        Ok(zeroconf) => zeroconf,
        Err(err) =>
        {
            error!("Failed to start zeroconf: {}", err);
            return;
        }
    };

    match zeroconf.get_hostname()
    {
        Ok(hostname) =>
        {
            info!("Local hostname: {}", hostname);
        },
        Err(err) =>
        {
            error!("Failed to get hostname: {}", err);
        }
    }

    // Publish a demo HTTP service with a couple of TXT properties. The
    // returned name may carry a suffix if the requested one was taken.
    let mut props = HashMap::new();
    props.insert("path".to_string(), "/".to_string());
    props.insert("version".to_string(), "1".to_string());

    let name = match zeroconf.register("_http._tcp.", "local.", "demo", 8080, &props)
    {
        Ok(name) => name,
        Err(err) =>
        {
            error!("Failed to register service: {}", err);
            return;
        }
    };

    info!("Registered as {}", name);

    // Watch the same type; our own announcement shows up here too.
    if let Err(err) = zeroconf.watch("_http._tcp.", "local.")
    {
        error!("Failed to watch: {}", err);
        return;
    }

    for _ in 0..60
    {
        let event = match zeroconf.recv_event_timeout(Duration::from_secs(1))
        {
            Some(event) => event,
            None => continue
        };

        match event.action
        {
            DiscoveryAction::Resolved =>
            {
                info!(
                    "Resolved {} at {}:{} ({:?})",
                    event.service.name,
                    event.service.hostname,
                    event.service.port,
                    event.service.ipv4_addresses
                );
            },
            action =>
            {
                info!("{}: {}", action, event.service.name);
            }
        }
    }

    if let Err(err) = zeroconf.close()
    {
        error!("Failed to close: {}", err);
    }
}
