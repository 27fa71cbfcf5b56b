use std::env;
use std::time::Duration;

use libzeroconf::{ DiscoveryAction, ZeroConf };

// Small browse tool: `zeroconf-browse [type] [domain]` prints discovery
// events for one service type until interrupted.
fn main()
{
    let args: Vec<String> = env::args().collect();
    let type_name = args.get(1).map(String::as_str).unwrap_or("_http._tcp.");
    let domain = args.get(2).map(String::as_str).unwrap_or("local.");

    let zeroconf = match ZeroConf::new()
    {
        Ok(zeroconf) => zeroconf,
        Err(err) =>
        {
            eprintln!("Failed to start: {}", err);
            return;
        }
    };

    if let Err(err) = zeroconf.watch(type_name, domain)
    {
        eprintln!("Failed to watch {}{}: {}", type_name, domain, err);
        return;
    }

    println!("Browsing for {}{}", type_name, domain);

    loop
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
                println!(
                    "{:<9} {}  {}:{}  v4 {:?}  v6 {:?}  txt {:?}",
                    event.action.to_string(),
                    event.service.name,
                    event.service.hostname,
                    event.service.port,
                    event.service.ipv4_addresses,
                    event.service.ipv6_addresses,
                    event.service.txt_record
                );
            },
            _ =>
            {
                println!("{:<9} {}", event.action.to_string(), event.service.name);
            }
        }
    }
}
