//! Address resolution for listeners, outbound binds, mirror targets and
//! negotiated destinations. IPv4 only.

use anyhow::{Context, Result, anyhow, bail};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::lookup_host;
use tracing::debug;

/// interface_ipv4 looks up the first IPv4 address configured on the local
/// interface `name`. Returns None when no such interface (or address) exists
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs fills ifap with a list we release with freeifaddrs
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cursor = ifap;
    while !cursor.is_null() {
        // SAFETY: cursor is a non-null node of the list returned above
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }

        // SAFETY: ifa_addr is non-null and points at a sockaddr
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        if family != libc::AF_INET {
            continue;
        }

        // SAFETY: ifa_name is a NUL-terminated string owned by the list
        let ifname = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if ifname.to_bytes() != name.as_bytes() {
            continue;
        }

        // SAFETY: AF_INET entries carry a sockaddr_in
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    // SAFETY: ifap came from a successful getifaddrs and is freed once
    unsafe { libc::freeifaddrs(ifap) };

    found
}

#[cfg(not(unix))]
pub fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    None
}

/// resolve_bind_address turns an interface name, IP literal or hostname plus
/// a port into every IPv4 socket address it stands for. Interface names win
/// over hostnames of the same spelling
pub async fn resolve_bind_address(iface_or_ip: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Some(ip) = interface_ipv4(iface_or_ip) {
        debug!("interface {iface_or_ip} has address {ip}");
        return Ok(vec![SocketAddr::V4(SocketAddrV4::new(ip, port))]);
    }

    let addrs: Vec<SocketAddr> = lookup_host((iface_or_ip, port))
        .await
        .with_context(|| format!("unable to resolve host: {iface_or_ip}"))?
        .filter(SocketAddr::is_ipv4)
        .collect();

    if addrs.is_empty() {
        bail!("no IPv4 address found for {iface_or_ip}");
    }

    Ok(addrs)
}

/// resolve_host_port_pair resolves a "host:port" string, splitting on the
/// last colon, to its first IPv4 socket address
pub async fn resolve_host_port_pair(pair: &str) -> Result<SocketAddr> {
    let (host, port) = pair
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("malformed address: {pair}"))?;

    let port = resolve_port(port).with_context(|| format!("malformed port in address: {pair}"))?;

    resolve_bind_address(host, port)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no IPv4 address found for {pair}"))
}

/// resolve_port accepts a numeric port or a TCP service name from the
/// services database
pub fn resolve_port(port: &str) -> Result<u16> {
    if let Ok(n) = port.parse::<u16>() {
        return Ok(n);
    }

    service_port(port).ok_or_else(|| anyhow!("unknown port or service: {port}"))
}

#[cfg(unix)]
fn service_port(name: &str) -> Option<u16> {
    use std::{ffi::CString, sync::Mutex};

    // getservbyname returns a pointer into static storage
    static SERVICES: Mutex<()> = Mutex::new(());

    let name = CString::new(name).ok()?;
    let _guard = SERVICES.lock().unwrap_or_else(|e| e.into_inner());

    // SAFETY: both arguments are NUL-terminated; the result is read before
    // the lock is released
    let entry = unsafe { libc::getservbyname(name.as_ptr(), c"tcp".as_ptr()) };
    if entry.is_null() {
        return None;
    }

    // SAFETY: non-null entry from getservbyname; s_port is in network order
    let port = unsafe { (*entry).s_port };
    Some(u16::from_be(port as u16))
}

#[cfg(not(unix))]
fn service_port(_name: &str) -> Option<u16> {
    None
}

/// reverse_lookup finds the short host name of `ip`, as used in session
/// descriptions. Returns None when the address has no name
pub async fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    tokio::task::spawn_blocking(move || host_name(ip))
        .await
        .ok()
        .flatten()
}

#[cfg(unix)]
fn host_name(ip: Ipv4Addr) -> Option<String> {
    use std::ffi::CStr;

    const HOST_LEN: usize = 1025;

    let addr = socket2::SockAddr::from(SocketAddr::V4(SocketAddrV4::new(ip, 0)));
    let mut host = [0 as libc::c_char; HOST_LEN];

    // SAFETY: addr is a valid sockaddr of addr.len() bytes and host is a
    // writable buffer of HOST_LEN bytes; no service is requested
    let rc = unsafe {
        libc::getnameinfo(
            addr.as_ptr(),
            addr.len(),
            host.as_mut_ptr(),
            HOST_LEN as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NOFQDN | libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }

    // SAFETY: on success getnameinfo NUL-terminates host
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    name.to_str().ok().map(str::to_string)
}

#[cfg(not(unix))]
fn host_name(_ip: Ipv4Addr) -> Option<String> {
    None
}

/// passive_addrs returns the wildcard listening address for `port`
pub fn passive_addrs(port: u16) -> Vec<SocketAddr> {
    vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))]
}

/// resolve_host_all resolves a hostname to every IPv4 address it has
pub async fn resolve_host_all(hostname: &str) -> Result<Vec<Ipv4Addr>> {
    let addrs: Vec<Ipv4Addr> = lookup_host((hostname, 0))
        .await
        .with_context(|| format!("error resolving name {hostname}"))?
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .collect();

    if addrs.is_empty() {
        bail!("no IPv4 address found for {hostname}");
    }

    Ok(addrs)
}

/// resolve_host resolves a hostname to its first IPv4 address
pub async fn resolve_host(hostname: &str) -> Result<Ipv4Addr> {
    Ok(resolve_host_all(hostname).await?[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_resolves_to_itself() {
        let addrs = resolve_bind_address("127.0.0.1", 1080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn host_port_pair_splits_on_last_colon() {
        let addr = resolve_host_port_pair("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn host_port_pair_without_colon_fails() {
        assert!(resolve_host_port_pair("127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn host_port_pair_with_unknown_service_fails() {
        assert!(resolve_host_port_pair("127.0.0.1:no-such-service").await.is_err());
        assert!(resolve_host_port_pair("127.0.0.1:70000").await.is_err());
    }

    #[tokio::test]
    async fn host_port_pair_accepts_service_names() {
        // Minimal images may ship without a services database
        if !std::path::Path::new("/etc/services").exists() {
            return;
        }

        let addr = resolve_host_port_pair("127.0.0.1:http").await.unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn numeric_ports_skip_the_services_database() {
        assert_eq!(resolve_port("1080").unwrap(), 1080);
        assert_eq!(resolve_port("0").unwrap(), 0);
        assert!(resolve_port("").is_err());
    }

    #[tokio::test]
    async fn loopback_reverse_name_comes_from_hosts() {
        // /etc/hosts normally names 127.0.0.1; an image without it gets None
        if let Some(name) = reverse_lookup(Ipv4Addr::LOCALHOST).await {
            assert!(!name.is_empty());
            assert_ne!(name, "127.0.0.1");
        }
    }

    #[tokio::test]
    async fn unresolvable_host_fails() {
        assert!(resolve_host("no-such-host.invalid").await.is_err());
    }

    #[test]
    fn passive_address_is_wildcard() {
        assert_eq!(
            passive_addrs(1080),
            vec!["0.0.0.0:1080".parse::<SocketAddr>().unwrap()]
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn loopback_interface_name_resolves() {
        assert_eq!(interface_ipv4("lo"), Some(Ipv4Addr::LOCALHOST));

        let addrs = resolve_bind_address("lo", 0).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:0".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn unknown_interface_has_no_address() {
        assert_eq!(interface_ipv4("definitely-not-an-iface0"), None);
    }
}
