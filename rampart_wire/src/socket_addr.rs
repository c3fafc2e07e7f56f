//! The peer address value type for the Rampart transport.
//!
//! A [`SocketAddress`] identifies a peer uniformly across address families:
//! IPv4, IPv6, and Local (unix-domain). Local addresses carry three
//! sub-kinds: anonymous (empty path), abstract namespace (leading NUL,
//! compared length-exact), and ordinary filesystem paths.
//!
//! Anonymous Local addresses are never equal to anything, themselves
//! included, so this type implements `PartialEq`/`PartialOrd` but not
//! `Eq`/`Ord`; hashing is the explicit, fallible [`SocketAddress::hash_address`].

use std::cmp::Ordering;
use std::fmt::Formatter;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv6Addr};

use arrayvec::ArrayVec;
use twox_hash::XxHash64;

use crate::error::AddrError;

/// Capacity of `sun_path` on the platforms this crate targets
pub const LOCAL_PATH_MAX: usize = 108;

// offset of sun_path within sockaddr_un (one u16 family field)
const LOCAL_PATH_OFFSET: usize = 2;
const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

/// The address family tag, ordered by the OS numeric value
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddressFamily {
    Unspecified,
    Local,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The numeric `AF_*` tag for this family
    pub fn os_value(self) -> i32 {
        match self {
            AddressFamily::Unspecified => libc::AF_UNSPEC,
            AddressFamily::Local => libc::AF_UNIX,
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }
}

/// The payload of a Local (unix-domain) address: at most [`LOCAL_PATH_MAX`]
/// bytes, stored exactly as they identify the socket (no terminator)
#[derive(Clone, Debug, Default)]
pub struct LocalPath {
    bytes: ArrayVec<u8, LOCAL_PATH_MAX>,
}

impl LocalPath {
    /// An anonymous (unbound) address has an empty path
    pub fn is_anonymous(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Abstract-namespace addresses are identified by a leading NUL and are
    /// compared by their exact length
    pub fn is_abstract(&self) -> bool {
        self.bytes.first() == Some(&0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A peer address, polymorphic over the address family. Default-constructed
/// as `Unspecified`; the `set_from_*` operations replace family and payload
/// in one assignment, so no partially-updated state is ever observable.
#[derive(Clone, Debug, Default)]
pub enum SocketAddress {
    #[default]
    Unspecified,
    Ip {
        addr: IpAddr,
        port: u16,
    },
    Local(LocalPath),
}

impl SocketAddress {
    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::Unspecified => AddressFamily::Unspecified,
            SocketAddress::Ip {
                addr: IpAddr::V4(_),
                ..
            } => AddressFamily::Ipv4,
            SocketAddress::Ip {
                addr: IpAddr::V6(_),
                ..
            } => AddressFamily::Ipv6,
            SocketAddress::Local(_) => AddressFamily::Local,
        }
    }

    /// Builds an address from a numeric host literal and a port. No name
    /// resolution is attempted; a non-numeric host fails with `Resolution`.
    pub fn from_ip_port(host: &str, port: u16) -> Result<Self, AddrError> {
        let addr = host.parse::<IpAddr>().map_err(|_| {
            AddrError::Resolution(format!(
                "Failed to resolve address for \"{host}\": not a numeric host"
            ))
        })?;
        Ok(SocketAddress::Ip { addr, port })
    }

    /// Builds an address from a `"host:port"` string (bracketed IPv6
    /// accepted). The port is required in this form.
    pub fn from_ip_port_str(host_and_port: &str) -> Result<Self, AddrError> {
        let (host, port) = split_host_port(host_and_port)?;
        Self::from_ip_port(host, port)
    }

    /// Like [`Self::from_ip_port`], but permits hostname resolution. When
    /// both families resolve, the IPv6 result is preferred.
    pub async fn from_host_port(host: &str, port: u16) -> Result<Self, AddrError> {
        let results = tokio::net::lookup_host((host, port)).await.map_err(|err| {
            AddrError::Resolution(format!("Failed to resolve address for \"{host}\": {err}"))
        })?;

        let mut first = None;
        for resolved in results {
            if resolved.is_ipv6() {
                log::trace!(target: "rampart", "Resolved {host} => {resolved} (ipv6 preferred)");
                return Ok(SocketAddress::Ip {
                    addr: resolved.ip(),
                    port: resolved.port(),
                });
            }

            if first.is_none() {
                first = Some(resolved);
            }
        }

        first
            .map(|resolved| SocketAddress::Ip {
                addr: resolved.ip(),
                port: resolved.port(),
            })
            .ok_or_else(|| {
                AddrError::Resolution(format!(
                    "Failed to resolve address for \"{host}\": no addresses returned"
                ))
            })
    }

    /// `"host:port"` form of [`Self::from_host_port`]
    pub async fn from_host_port_str(host_and_port: &str) -> Result<Self, AddrError> {
        let (host, port) = split_host_port(host_and_port)?;
        Self::from_host_port(host, port).await
    }

    /// Builds a Local address from raw path bytes. An exact
    /// [`LOCAL_PATH_MAX`]-byte path is legal with no terminator stored,
    /// mirroring what the kernel may report back for a bound socket.
    pub fn from_local_path(path: &[u8]) -> Result<Self, AddrError> {
        let mut bytes = ArrayVec::new();
        bytes
            .try_extend_from_slice(path)
            .map_err(|_| AddrError::BadArgument("socket path too large to fit into sun_path"))?;
        Ok(SocketAddress::Local(LocalPath { bytes }))
    }

    /// Parses raw `sockaddr` bytes as returned by the OS. Local addresses
    /// require an explicit `declared_len`, since a raw unix sockaddr has no
    /// terminator that could distinguish anonymous addresses from the
    /// abstract namespace.
    pub fn from_raw_sockaddr(bytes: &[u8], declared_len: Option<usize>) -> Result<Self, AddrError> {
        let len = declared_len.unwrap_or(bytes.len());
        if len > bytes.len() {
            return Err(AddrError::BadArgument(
                "declared length exceeds the supplied buffer",
            ));
        }
        if len < LOCAL_PATH_OFFSET {
            return Err(AddrError::BadArgument("length too short for a sockaddr"));
        }

        let family = i32::from(u16::from_ne_bytes([bytes[0], bytes[1]]));
        if family == libc::AF_INET {
            if len < SOCKADDR_IN_LEN {
                return Err(AddrError::BadArgument("length too short for a sockaddr_in"));
            }
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let addr = IpAddr::from([bytes[4], bytes[5], bytes[6], bytes[7]]);
            return Ok(SocketAddress::Ip { addr, port });
        }

        if family == libc::AF_INET6 {
            if len < SOCKADDR_IN6_LEN {
                return Err(AddrError::BadArgument(
                    "length too short for a sockaddr_in6",
                ));
            }
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            return Ok(SocketAddress::Ip {
                addr: IpAddr::from(octets),
                port,
            });
        }

        if family == libc::AF_UNIX {
            let declared = declared_len.ok_or(AddrError::AmbiguousLength)?;
            if declared > LOCAL_PATH_OFFSET + LOCAL_PATH_MAX {
                return Err(AddrError::BadArgument("length too long for a sockaddr_un"));
            }
            let raw_path = &bytes[LOCAL_PATH_OFFSET..declared];
            let logical = if raw_path.is_empty() || raw_path[0] == 0 {
                // anonymous, or abstract namespace: honor the exact length
                raw_path
            } else {
                // ordinary path: the length may be overspecified, so stop
                // at the first NUL
                let end = raw_path
                    .iter()
                    .position(|b| *b == 0)
                    .unwrap_or(raw_path.len());
                &raw_path[..end]
            };
            return Self::from_local_path(logical);
        }

        Err(AddrError::BadArgument("unsupported address family"))
    }

    /// Queries the peer name of a connected socket
    pub fn from_peer_socket(socket: &socket2::Socket) -> Result<Self, AddrError> {
        Self::from_sock_addr(&socket.peer_addr().map_err(AddrError::System)?)
    }

    /// Queries the local name of a bound socket
    pub fn from_local_socket(socket: &socket2::Socket) -> Result<Self, AddrError> {
        Self::from_sock_addr(&socket.local_addr().map_err(AddrError::System)?)
    }

    /// Converts an OS-level address into a [`SocketAddress`]
    pub fn from_sock_addr(addr: &socket2::SockAddr) -> Result<Self, AddrError> {
        if let Some(ip) = addr.as_socket() {
            return Ok(SocketAddress::Ip {
                addr: ip.ip(),
                port: ip.port(),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;

            if addr.domain() == socket2::Domain::UNIX {
                if let Some(path) = addr.as_pathname() {
                    return Self::from_local_path(path.as_os_str().as_bytes());
                }

                #[cfg(any(target_os = "linux", target_os = "android"))]
                if let Some(name) = addr.as_abstract_namespace() {
                    let mut path = Vec::with_capacity(name.len() + 1);
                    path.push(0);
                    path.extend_from_slice(name);
                    return Self::from_local_path(&path);
                }

                return Ok(SocketAddress::Local(LocalPath::default()));
            }
        }

        Err(AddrError::BadArgument("unsupported address family"))
    }

    pub fn set_from_ip_port(&mut self, host: &str, port: u16) -> Result<(), AddrError> {
        *self = Self::from_ip_port(host, port)?;
        Ok(())
    }

    pub fn set_from_ip_port_str(&mut self, host_and_port: &str) -> Result<(), AddrError> {
        *self = Self::from_ip_port_str(host_and_port)?;
        Ok(())
    }

    pub fn set_from_local_path(&mut self, path: &[u8]) -> Result<(), AddrError> {
        *self = Self::from_local_path(path)?;
        Ok(())
    }

    pub fn set_from_raw_sockaddr(
        &mut self,
        bytes: &[u8],
        declared_len: Option<usize>,
    ) -> Result<(), AddrError> {
        *self = Self::from_raw_sockaddr(bytes, declared_len)?;
        Ok(())
    }

    pub fn ip_addr(&self) -> Result<IpAddr, AddrError> {
        match self {
            SocketAddress::Ip { addr, .. } => Ok(*addr),
            _ => Err(AddrError::WrongFamily(
                "ip_addr called on a non-ip address",
            )),
        }
    }

    pub fn port(&self) -> Result<u16, AddrError> {
        match self {
            SocketAddress::Ip { port, .. } => Ok(*port),
            _ => Err(AddrError::WrongFamily("port called on a non-ip address")),
        }
    }

    pub fn set_port(&mut self, new_port: u16) -> Result<(), AddrError> {
        match self {
            SocketAddress::Ip { port, .. } => {
                *port = new_port;
                Ok(())
            }
            _ => Err(AddrError::WrongFamily(
                "set_port called on a non-ip address",
            )),
        }
    }

    pub fn path(&self) -> Result<&[u8], AddrError> {
        match self {
            SocketAddress::Local(path) => Ok(path.as_bytes()),
            _ => Err(AddrError::WrongFamily(
                "path called on a non-local address",
            )),
        }
    }

    /// The canonical string rendering of the IP address, without the port
    pub fn address_str(&self) -> Result<String, AddrError> {
        match self {
            SocketAddress::Ip { addr, .. } => Ok(addr.to_string()),
            _ => Err(AddrError::WrongFamily(
                "address_str called on a non-ip address",
            )),
        }
    }

    /// Non-abbreviated rendering: IPv6 addresses are expanded to all eight
    /// hextets
    pub fn fully_qualified(&self) -> Result<String, AddrError> {
        match self {
            SocketAddress::Ip {
                addr: IpAddr::V4(v4),
                ..
            } => Ok(v4.to_string()),
            SocketAddress::Ip {
                addr: IpAddr::V6(v6),
                ..
            } => {
                let segments = v6.segments();
                let hextets: Vec<String> =
                    segments.iter().map(|seg| format!("{seg:04x}")).collect();
                Ok(hextets.join(":"))
            }
            _ => Err(AddrError::WrongFamily(
                "fully_qualified called on a non-ip address",
            )),
        }
    }

    /// Local addresses are always private to the host; IP families use the
    /// standard private ranges plus loopback and link-local
    pub fn is_private(&self) -> bool {
        match self {
            SocketAddress::Unspecified => false,
            SocketAddress::Local(_) => true,
            SocketAddress::Ip { addr, .. } => match normalize_mapped(*addr) {
                IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
                IpAddr::V6(v6) => {
                    v6.is_loopback() || is_unique_local_v6(&v6) || is_link_local_v6(&v6)
                }
            },
        }
    }

    /// Local addresses are always local to the host, so this returns true
    /// for them as well
    pub fn is_loopback(&self) -> bool {
        match self {
            SocketAddress::Unspecified => false,
            SocketAddress::Local(_) => true,
            SocketAddress::Ip { addr, .. } => match normalize_mapped(*addr) {
                IpAddr::V4(v4) => v4.is_loopback(),
                IpAddr::V6(v6) => v6.is_loopback(),
            },
        }
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        matches!(
            self,
            SocketAddress::Ip {
                addr: IpAddr::V6(v6),
                ..
            } if v6.to_ipv4_mapped().is_some()
        )
    }

    /// Collapses an IPv4-mapped IPv6 address into its IPv4 form. Returns
    /// false (leaving the value untouched) for anything else.
    pub fn try_convert_to_ipv4(&mut self) -> bool {
        if let SocketAddress::Ip {
            addr: IpAddr::V6(v6),
            ..
        } = self
        {
            if let Some(v4) = v6.to_ipv4_mapped() {
                if let SocketAddress::Ip { addr, .. } = self {
                    *addr = IpAddr::V4(v4);
                }
                return true;
            }
        }

        false
    }

    pub fn convert_to_ipv4(&mut self) -> Result<(), AddrError> {
        if self.try_convert_to_ipv4() {
            Ok(())
        } else {
            Err(AddrError::WrongFamily(
                "convert_to_ipv4 called on an address that is not an IPv4-mapped address",
            ))
        }
    }

    /// Widens an IPv4 address into its IPv4-mapped IPv6 form. Returns false
    /// for any other family; never fails.
    pub fn map_to_ipv6(&mut self) -> bool {
        if let SocketAddress::Ip {
            addr: addr @ IpAddr::V4(_),
            ..
        } = self
        {
            if let IpAddr::V4(v4) = *addr {
                *addr = IpAddr::V6(v4.to_ipv6_mapped());
            }
            return true;
        }

        false
    }

    /// True when the longest common bit prefix of two same-family IP
    /// addresses covers at least `prefix_len` bits. Local addresses never
    /// prefix-match.
    pub fn prefix_match(&self, other: &SocketAddress, prefix_len: u32) -> bool {
        if self.family() != other.family() {
            return false;
        }

        match (self, other) {
            (SocketAddress::Ip { addr: a, .. }, SocketAddress::Ip { addr: b, .. }) => {
                match (a, b) {
                    (IpAddr::V4(a), IpAddr::V4(b)) => {
                        let (a, b) = (u32::from(*a), u32::from(*b));
                        let common = (a ^ b).leading_zeros();
                        common >= prefix_len.min(32)
                    }
                    (IpAddr::V6(a), IpAddr::V6(b)) => {
                        let (a, b) = (u128::from(*a), u128::from(*b));
                        let common = (a ^ b).leading_zeros();
                        common >= prefix_len.min(128)
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Seeded by the family tag; IP families fold in the port then the
    /// address octets, Local folds in each path byte. An uninitialized
    /// address is unhashable.
    pub fn hash_address(&self) -> Result<u64, AddrError> {
        let mut hasher = XxHash64::with_seed(self.family().os_value() as u64);
        match self {
            SocketAddress::Unspecified => {
                return Err(AddrError::WrongFamily(
                    "hash_address called on an uninitialized address",
                ))
            }
            SocketAddress::Ip { addr, port } => {
                hasher.write_u16(*port);
                match addr {
                    IpAddr::V4(v4) => hasher.write(&v4.octets()),
                    IpAddr::V6(v6) => hasher.write(&v6.octets()),
                }
            }
            SocketAddress::Local(path) => {
                for byte in path.as_bytes() {
                    hasher.write_u8(*byte);
                }
            }
        }

        Ok(hasher.finish())
    }

    /// Human-readable rendering, usable for logging regardless of family
    pub fn describe(&self) -> String {
        match self {
            SocketAddress::Unspecified => "<uninitialized>".to_string(),
            SocketAddress::Ip {
                addr: IpAddr::V4(v4),
                port,
            } => format!("{v4}:{port}"),
            SocketAddress::Ip {
                addr: IpAddr::V6(v6),
                port,
            } => format!("[{v6}]:{port}"),
            SocketAddress::Local(path) => {
                if path.is_anonymous() {
                    "<anonymous>".to_string()
                } else if path.is_abstract() {
                    "<abstract>".to_string()
                } else {
                    String::from_utf8_lossy(path.as_bytes()).into_owned()
                }
            }
        }
    }
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.family() != other.family() {
            return false;
        }

        match (self, other) {
            (SocketAddress::Unspecified, SocketAddress::Unspecified) => true,
            (
                SocketAddress::Ip { addr: a, port: pa },
                SocketAddress::Ip { addr: b, port: pb },
            ) => a == b && pa == pb,
            (SocketAddress::Local(a), SocketAddress::Local(b)) => {
                // anonymous addresses are never equal to any other address
                if a.is_anonymous() || b.is_anonymous() {
                    return false;
                }
                a.as_bytes() == b.as_bytes()
            }
            _ => false,
        }
    }
}

impl PartialOrd for SocketAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let (fa, fb) = (self.family().os_value(), other.family().os_value());
        if fa != fb {
            return Some(fa.cmp(&fb));
        }

        match (self, other) {
            (SocketAddress::Unspecified, SocketAddress::Unspecified) => Some(Ordering::Equal),
            (
                SocketAddress::Ip { addr: a, port: pa },
                SocketAddress::Ip { addr: b, port: pb },
            ) => Some(pa.cmp(pb).then_with(|| ip_bits(a).cmp(&ip_bits(b)))),
            (SocketAddress::Local(a), SocketAddress::Local(b)) => {
                // anonymous addresses cannot be compared to anything else;
                // they are never less than anything, which still satisfies
                // strict-weak ordering for sorted containers
                match (a.is_anonymous(), b.is_anonymous()) {
                    (true, true) => None,
                    (true, false) => Some(Ordering::Greater),
                    (false, true) => Some(Ordering::Less),
                    (false, false) => Some(
                        a.as_bytes()
                            .len()
                            .cmp(&b.as_bytes().len())
                            .then_with(|| a.as_bytes().cmp(b.as_bytes())),
                    ),
                }
            }
            _ => None,
        }
    }
}

fn ip_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn normalize_mapped(addr: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = addr {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return IpAddr::V4(v4);
        }
    }
    addr
}

fn is_unique_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn split_host_port(host_and_port: &str) -> Result<(&str, u16), AddrError> {
    let colon = host_and_port.rfind(':').ok_or_else(|| {
        AddrError::Malformed(format!(
            "expected a host and port string of the form \"<host>:<port>\": {host_and_port}"
        ))
    })?;

    let (mut host, port_str) = (&host_and_port[..colon], &host_and_port[colon + 1..]);
    // bracketed IPv6 address, remove the brackets
    if host.starts_with('[') && host.ends_with(']') {
        host = &host[1..host.len() - 1];
    }

    let port = port_str
        .parse::<u16>()
        .map_err(|_| AddrError::Malformed(format!("invalid port in \"{host_and_port}\"")))?;

    Ok((host, port))
}
