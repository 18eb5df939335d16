#[cfg(unix)]
use std::ffi::CStr;
use std::net::Ipv4Addr;

/// Interfaces tried first, in order, before any other non-loopback IPv4.
#[cfg(unix)]
const PREFERRED_INTERFACES: &[&str] = &["en0", "en1"];

/// Best-guess local IPv4 address for peers on the same network.
///
/// Returns `None` when no interface is up with a non-loopback address.
#[cfg(unix)]
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let candidates = interface_addresses();
    PREFERRED_INTERFACES
        .iter()
        .find_map(|name| {
            candidates
                .iter()
                .find(|(iface, _)| iface == name)
                .map(|(_, addr)| *addr)
        })
        .or_else(|| candidates.first().map(|(_, addr)| *addr))
}

#[cfg(not(unix))]
pub fn local_ipv4() -> Option<Ipv4Addr> {
    None
}

#[cfg(unix)]
fn interface_addresses() -> Vec<(String, Ipv4Addr)> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: `getifaddrs` fills `head` with a list we free below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by `getifaddrs`, which
        // stays valid until `freeifaddrs`.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        let up = entry.ifa_flags & libc::IFF_UP as libc::c_uint != 0;
        let loopback = entry.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0;
        if !up || loopback || entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        // SAFETY: non-null `ifa_addr` points to a sockaddr whose family
        // field is always readable.
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if family as libc::c_int != libc::AF_INET {
            continue;
        }
        // SAFETY: family is AF_INET, so the address is a `sockaddr_in`.
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        // SAFETY: `ifa_name` is a NUL-terminated interface name.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        found.push((name, addr));
    }

    // SAFETY: `head` came from a successful `getifaddrs`.
    unsafe { libc::freeifaddrs(head) };
    found
}
