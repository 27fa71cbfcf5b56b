use std::{ error::Error, fmt::Display };

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZeroConfError
{
    Timeout,
    UdpSocketError,
    NoInterface,
    NameConflict,
    NotAvailable,
    Closed,
    WatchAlreadyActive,
    WatchNotFound,
    ServiceAlreadyRegistered,
    ServiceNotRegistered,
    InvalidServiceType,
    InvalidHeader,
    TruncatedPacket,
    InvalidRecord,
    LabelTooLong,
    InvalidUtf8,
    LabelCompressionLoop,
    LabelPtrForward,
    LabelInvalid
}

impl ZeroConfError
{
    // Decode failures are dropped per-datagram in the receive loop and must
    // never tear down the transport.
    pub fn is_malformed_packet(&self) -> bool
    {
        match self
        {
            ZeroConfError::InvalidHeader => true,
            ZeroConfError::TruncatedPacket => true,
            ZeroConfError::InvalidRecord => true,
            ZeroConfError::LabelTooLong => true,
            ZeroConfError::InvalidUtf8 => true,
            ZeroConfError::LabelCompressionLoop => true,
            ZeroConfError::LabelPtrForward => true,
            ZeroConfError::LabelInvalid => true,
            _ => false
        }
    }
}

impl Error for ZeroConfError
{
}

impl From<std::io::Error> for ZeroConfError
{
    fn from(err: std::io::Error) -> Self
    {
        match err.kind()
        {
            std::io::ErrorKind::TimedOut => ZeroConfError::Timeout,
            std::io::ErrorKind::WouldBlock => ZeroConfError::Timeout,
            std::io::ErrorKind::PermissionDenied => ZeroConfError::NotAvailable,
            std::io::ErrorKind::Unsupported => ZeroConfError::NotAvailable,
            std::io::ErrorKind::AddrNotAvailable => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::AddrInUse => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::AlreadyExists => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::ConnectionRefused => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::ConnectionReset => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::ConnectionAborted => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::NotConnected => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::Interrupted => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::InvalidInput => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::InvalidData => ZeroConfError::UdpSocketError,
            std::io::ErrorKind::UnexpectedEof => ZeroConfError::UdpSocketError,
            _ => ZeroConfError::UdpSocketError
        }
    }
}

impl Display for ZeroConfError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            ZeroConfError::Timeout =>
            {
                write!(f, "ZeroConf error: Timeout")
            },
            ZeroConfError::UdpSocketError =>
            {
                write!(f, "ZeroConf error: UDP socket error")
            },
            ZeroConfError::NoInterface =>
            {
                write!(f, "ZeroConf error: No multicast capable interface")
            },
            ZeroConfError::NameConflict =>
            {
                write!(f, "ZeroConf error: Service name conflict")
            },
            ZeroConfError::NotAvailable =>
            {
                write!(f, "ZeroConf error: Multicast DNS not available in this environment")
            },
            ZeroConfError::Closed =>
            {
                write!(f, "ZeroConf error: Engine is closed")
            },
            ZeroConfError::WatchAlreadyActive =>
            {
                write!(f, "ZeroConf error: A watch for this type is already active")
            },
            ZeroConfError::WatchNotFound =>
            {
                write!(f, "ZeroConf error: No active watch for this type")
            },
            ZeroConfError::ServiceAlreadyRegistered =>
            {
                write!(f, "ZeroConf error: Service with this name is already registered")
            },
            ZeroConfError::ServiceNotRegistered =>
            {
                write!(f, "ZeroConf error: Service not found or already unregistered")
            },
            ZeroConfError::InvalidServiceType =>
            {
                write!(f, "ZeroConf error: Invalid service type")
            },
            ZeroConfError::InvalidHeader =>
            {
                write!(f, "ZeroConf error: Invalid mDNS header")
            },
            ZeroConfError::TruncatedPacket =>
            {
                write!(f, "ZeroConf error: Truncated mDNS packet")
            },
            ZeroConfError::InvalidRecord =>
            {
                write!(f, "ZeroConf error: Invalid resource record")
            },
            ZeroConfError::LabelTooLong =>
            {
                write!(f, "ZeroConf error: Label too long")
            },
            ZeroConfError::InvalidUtf8 =>
            {
                write!(f, "ZeroConf error: Invalid UTF-8")
            },
            ZeroConfError::LabelCompressionLoop =>
            {
                write!(f, "ZeroConf error: Label compression loop")
            },
            ZeroConfError::LabelPtrForward =>
            {
                write!(f, "ZeroConf error: Label pointer pointing forward")
            },
            ZeroConfError::LabelInvalid =>
            {
                write!(f, "ZeroConf error: Label invalid")
            }
        }
    }
}
