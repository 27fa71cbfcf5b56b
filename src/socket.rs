use std::{ net::{ IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket }, io, time::Duration };
use socket2::{ Socket, Domain, Type, SockAddr, Protocol };
use log::{ debug, info, warn };

use crate::zeroconf_error::ZeroConfError;

pub const MULTICAST_PORT: u16 = 5353;
pub const MULTICAST_ADDR_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MULTICAST_ADDR_IPV6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

// Receive loops wake on this interval to observe shutdown.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(250);

lazy_static!
{
    pub(crate) static ref MULTICAST_IPV4_SOCKET: SocketAddr = SocketAddr::new(IpAddr::V4(MULTICAST_ADDR_IPV4), MULTICAST_PORT);
    pub(crate) static ref MULTICAST_IPV6_SOCKET: SocketAddr = SocketAddr::new(IpAddr::V6(MULTICAST_ADDR_IPV6), MULTICAST_PORT);
}

fn create_socket(addr: &SocketAddr) -> io::Result<Socket>
{
    let domain = if addr.is_ipv4()
    {
        Domain::IPV4
    }
    else
    {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;

    Ok(socket)
}

fn bind_multicast(socket: Socket, addr: &SocketAddr) -> io::Result<Socket>
{
    // Bind the wildcard address so unicast replies to QU questions arrive on
    // the same socket as group traffic.
    let bind_addr = match addr
    {
        SocketAddr::V4(addr) =>
        {
            SockAddr::from(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()))
        },
        SocketAddr::V6(addr) =>
        {
            SockAddr::from(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), addr.port()))
        }
    };

    socket.bind(&bind_addr)?;
    Ok(socket)
}

fn usable_interfaces() -> Vec<default_net::Interface>
{
    default_net::get_interfaces()
        .into_iter()
        .filter(|interface|
        {
            if matches!(interface.if_type, default_net::interface::InterfaceType::Loopback)
            {
                return false;
            }

            !interface.ipv4.is_empty() || !interface.ipv6.is_empty()
        })
        .collect()
}

/// The shared socket set: one receive/send socket per address family, joined
/// to the mDNS group on every usable interface.
pub struct MulticastTransport
{
    v4_socket: Option<UdpSocket>,
    v6_socket: Option<UdpSocket>,
    joined_v4: Vec<Ipv4Addr>,
    joined_v6: Vec<u32>,
    v4_addresses: Vec<Ipv4Addr>,
    v6_addresses: Vec<Ipv6Addr>
}

impl MulticastTransport
{
    pub fn open() -> Result<MulticastTransport, ZeroConfError>
    {
        let interfaces = usable_interfaces();
        if interfaces.is_empty()
        {
            return Err(ZeroConfError::NoInterface);
        }

        let mut transport = MulticastTransport
        {
            v4_socket: None,
            v6_socket: None,
            joined_v4: Vec::new(),
            joined_v6: Vec::new(),
            v4_addresses: Vec::new(),
            v6_addresses: Vec::new()
        };

        for interface in interfaces.iter()
        {
            for net in interface.ipv4.iter()
            {
                transport.v4_addresses.push(net.addr);
            }

            for net in interface.ipv6.iter()
            {
                transport.v6_addresses.push(net.addr);
            }
        }

        match transport.open_v4(&interfaces)
        {
            Ok(()) => {},
            Err(ZeroConfError::NotAvailable) =>
            {
                return Err(ZeroConfError::NotAvailable);
            },
            Err(err) =>
            {
                // One family failing to open is not fatal as long as the
                // other one comes up.
                warn!("Failed to open IPv4 multicast socket: {}", err);
            }
        }

        match transport.open_v6(&interfaces)
        {
            Ok(()) => {},
            Err(ZeroConfError::NotAvailable) =>
            {
                if transport.v4_socket.is_none()
                {
                    return Err(ZeroConfError::NotAvailable);
                }
            },
            Err(err) =>
            {
                warn!("Failed to open IPv6 multicast socket: {}", err);
            }
        }

        if transport.v4_socket.is_none() && transport.v6_socket.is_none()
        {
            return Err(ZeroConfError::NoInterface);
        }

        info!(
            "Multicast transport open: {} IPv4 join(s), {} IPv6 join(s)",
            transport.joined_v4.len(),
            transport.joined_v6.len()
        );

        Ok(transport)
    }

    fn open_v4(&mut self, interfaces: &[default_net::Interface]) -> Result<(), ZeroConfError>
    {
        let socket = create_socket(&MULTICAST_IPV4_SOCKET)?;

        for interface in interfaces.iter()
        {
            // One join per interface is enough; use its first address.
            let addr = match interface.ipv4.first()
            {
                Some(net) => net.addr,
                None => continue
            };

            match socket.join_multicast_v4(&MULTICAST_ADDR_IPV4, &addr)
            {
                Ok(()) =>
                {
                    self.joined_v4.push(addr);
                },
                Err(err) =>
                {
                    debug!("Failed to join IPv4 group on {} ({}): {}", interface.name, addr, err);
                }
            }
        }

        if self.joined_v4.is_empty()
        {
            return Err(ZeroConfError::NoInterface);
        }

        let socket = bind_multicast(socket, &MULTICAST_IPV4_SOCKET)?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        self.v4_socket = Some(socket);
        Ok(())
    }

    fn open_v6(&mut self, interfaces: &[default_net::Interface]) -> Result<(), ZeroConfError>
    {
        let socket = create_socket(&MULTICAST_IPV6_SOCKET)?;
        socket.set_only_v6(true)?;

        for interface in interfaces.iter()
        {
            if interface.ipv6.is_empty()
            {
                continue;
            }

            match socket.join_multicast_v6(&MULTICAST_ADDR_IPV6, interface.index)
            {
                Ok(()) =>
                {
                    self.joined_v6.push(interface.index);
                },
                Err(err) =>
                {
                    debug!("Failed to join IPv6 group on {}: {}", interface.name, err);
                }
            }
        }

        if self.joined_v6.is_empty()
        {
            return Err(ZeroConfError::NoInterface);
        }

        let socket = bind_multicast(socket, &MULTICAST_IPV6_SOCKET)?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        self.v6_socket = Some(socket);
        Ok(())
    }

    /// Clones of the bound sockets, one per receive loop.
    pub fn receive_sockets(&self) -> Vec<UdpSocket>
    {
        let mut sockets = Vec::new();

        if let Some(socket) = &self.v4_socket
        {
            if let Ok(clone) = socket.try_clone()
            {
                sockets.push(clone);
            }
        }

        if let Some(socket) = &self.v6_socket
        {
            if let Ok(clone) = socket.try_clone()
            {
                sockets.push(clone);
            }
        }

        sockets
    }

    /// Multicast a packet on every open family.
    pub fn send(&self, buffer: &[u8]) -> Result<(), ZeroConfError>
    {
        let mut sent = false;
        let mut last_err = ZeroConfError::UdpSocketError;

        if let Some(socket) = &self.v4_socket
        {
            match socket.send_to(buffer, *MULTICAST_IPV4_SOCKET)
            {
                Ok(_) => sent = true,
                Err(err) =>
                {
                    debug!("Failed to send on IPv4 group: {}", err);
                    last_err = err.into();
                }
            }
        }

        if let Some(socket) = &self.v6_socket
        {
            match socket.send_to(buffer, *MULTICAST_IPV6_SOCKET)
            {
                Ok(_) => sent = true,
                Err(err) =>
                {
                    debug!("Failed to send on IPv6 group: {}", err);
                    last_err = err.into();
                }
            }
        }

        if !sent
        {
            return Err(last_err);
        }

        Ok(())
    }

    /// Direct reply to a single peer, used for unicast-response questions.
    pub fn send_unicast(&self, buffer: &[u8], addr: SocketAddr) -> Result<(), ZeroConfError>
    {
        let socket = match addr
        {
            SocketAddr::V4(_) => self.v4_socket.as_ref(),
            SocketAddr::V6(_) => self.v6_socket.as_ref()
        };

        match socket
        {
            Some(socket) =>
            {
                socket.send_to(buffer, addr)?;
                Ok(())
            },
            None =>
            {
                Err(ZeroConfError::UdpSocketError)
            }
        }
    }

    pub fn local_v4_addresses(&self) -> &Vec<Ipv4Addr>
    {
        return &self.v4_addresses;
    }

    pub fn local_v6_addresses(&self) -> &Vec<Ipv6Addr>
    {
        return &self.v6_addresses;
    }

    /// Leave all groups and release the sockets. Safe to call twice.
    pub fn close(&mut self)
    {
        if let Some(socket) = &self.v4_socket
        {
            for addr in self.joined_v4.iter()
            {
                if let Err(err) = socket.leave_multicast_v4(&MULTICAST_ADDR_IPV4, addr)
                {
                    debug!("Failed to leave IPv4 group on {}: {}", addr, err);
                }
            }
        }

        if let Some(socket) = &self.v6_socket
        {
            for index in self.joined_v6.iter()
            {
                if let Err(err) = socket.leave_multicast_v6(&MULTICAST_ADDR_IPV6, *index)
                {
                    debug!("Failed to leave IPv6 group on interface {}: {}", index, err);
                }
            }
        }

        self.v4_socket = None;
        self.v6_socket = None;
        self.joined_v4.clear();
        self.joined_v6.clear();
    }
}
