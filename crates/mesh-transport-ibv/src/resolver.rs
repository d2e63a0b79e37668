//! 可绑定地址解析。
//!
//! # 模块定位（Why）
//! - 监听器需要一个本机确实能够绑定的地址字符串；接口名与主机名是两条互相
//!   独立的来源，调用方按部署形态二选一。
//! - 名字解析得到的地址未必可绑定（容器内的外部映射、过期的 hosts 条目），
//!   因此主机名策略对每个候选做一次真实的绑定探测，宁可多一次系统调用也
//!   不把不可用地址交给上层。
//!
//! # 设计要点（How）
//! - **作用域资源**：接口枚举、`getaddrinfo` 结果链表与探测套接字都包装为
//!   RAII 作用域，任何退出路径（成功、出错、提前返回）都确定性释放；
//! - **首匹配**：接口扫描按枚举顺序取第一个名字与地址族都符合的条目，不做
//!   “最优”挑选；
//! - **首错保留**：绑定探测失败时只记录第一个候选的错误——它通常最具诊断
//!   价值；候选全部失败时返回该错误，候选列表为空则返回“未找到地址”。

use std::ffi::{CString, OsString};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;

use mesh_transport::TransportSocketAddr;
use nix::libc;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{self, IbvTransportError};

/// 按接口名解析可绑定地址。
///
/// # 契约（What）
/// - 按枚举顺序线性扫描，跳过没有底层地址的条目；第一个名字相符且地址族为
///   IPv4/IPv6 的条目立即胜出（首匹配语义）；
/// - 扫描耗尽仍无匹配时返回 [`IbvTransportError::NoAddressFound`]。
pub(crate) fn lookup_addr_for_iface(iface: &str) -> Result<String, IbvTransportError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|errno| {
        IbvTransportError::system(
            error::GETIFADDRS,
            std::io::Error::from_raw_os_error(errno as i32),
        )
    })?;

    for entry in addrs {
        // 没有底层地址的条目（纯链路层接口等）直接跳过。
        let Some(storage) = entry.address else {
            continue;
        };
        if entry.interface_name != iface {
            continue;
        }
        if let Some(sin) = storage.as_sockaddr_in() {
            let addr = SocketAddr::V4((*sin).into());
            return Ok(TransportSocketAddr::from(addr).to_string());
        }
        if let Some(sin6) = storage.as_sockaddr_in6() {
            let addr = SocketAddr::V6((*sin6).into());
            return Ok(TransportSocketAddr::from(addr).to_string());
        }
    }

    Err(IbvTransportError::NoAddressFound)
}

/// 按本机主机名解析可绑定地址。
///
/// # 契约（What）
/// - 解析主机名并展开为系统给出的有序候选列表（流式/TCP 语义）；
/// - 按解析顺序逐个做绑定探测，第一个绑定成功的候选胜出，其探测套接字随即
///   丢弃、绝不复用为通信套接字；
/// - 全部候选失败时返回保留的首个绑定错误；候选列表为空则返回
///   [`IbvTransportError::NoAddressFound`]。
pub(crate) fn lookup_addr_for_hostname() -> Result<String, IbvTransportError> {
    let hostname = nix::unistd::gethostname().map_err(|errno| {
        IbvTransportError::system(
            error::GETHOSTNAME,
            std::io::Error::from_raw_os_error(errno as i32),
        )
    })?;
    let info = AddressInfoList::resolve(&hostname)?;
    first_bindable(info.candidates())
}

/// `getaddrinfo` 结果链表的作用域包装，析构时调用 `freeaddrinfo`。
struct AddressInfoList {
    head: *mut libc::addrinfo,
}

impl AddressInfoList {
    /// 以流式/TCP 提示解析主机名。
    fn resolve(host: &OsString) -> Result<Self, IbvTransportError> {
        let host = CString::new(host.as_bytes())
            .map_err(|_| IbvTransportError::name_resolution(libc::EAI_NONAME))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        hints.ai_protocol = libc::IPPROTO_TCP;

        let mut head: *mut libc::addrinfo = std::ptr::null_mut();
        let rv = unsafe { libc::getaddrinfo(host.as_ptr(), std::ptr::null(), &hints, &mut head) };
        if rv != 0 {
            return Err(IbvTransportError::name_resolution(rv));
        }
        Ok(Self { head })
    }

    /// 按解析顺序产出标准库地址；未知地址族的条目被跳过。
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if let Some(addr) = sockaddr_to_std(entry.ai_family, entry.ai_addr) {
                out.push(addr);
            }
            cursor = entry.ai_next;
        }
        out
    }
}

impl Drop for AddressInfoList {
    fn drop(&mut self) {
        if !self.head.is_null() {
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

fn sockaddr_to_std(family: c_int, addr: *const libc::sockaddr) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match family {
        libc::AF_INET => {
            let v4 = unsafe { *addr.cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(v4.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { *addr.cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(v6.sin6_port),
                v6.sin6_flowinfo,
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// 对候选序列做绑定探测，返回第一个绑定成功者的展示字符串。
///
/// 每个候选至多一次绑定尝试，无重试、无超时；失败立即转向下一个候选。
pub(crate) fn first_bindable(
    candidates: impl IntoIterator<Item = SocketAddr>,
) -> Result<String, IbvTransportError> {
    let mut first_error: Option<IbvTransportError> = None;

    for candidate in candidates {
        match try_bind(candidate) {
            Ok(presentation) => return Ok(presentation),
            Err(err) => {
                // 首错保留：只有第一个候选的失败被记录下来用于最终报告。
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    Err(first_error.unwrap_or(IbvTransportError::NoAddressFound))
}

/// 以候选地址族建临时套接字并尝试绑定；成功即返回候选的展示字符串。
fn try_bind(candidate: SocketAddr) -> Result<String, IbvTransportError> {
    let domain = match candidate {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| IbvTransportError::system(error::SOCKET, err))?;
    socket
        .bind(&SockAddr::from(candidate))
        .map_err(|err| IbvTransportError::system(error::BIND, err))?;
    // 探测套接字在此丢弃：它只回答“能否绑定”，不承担任何通信职责。
    Ok(TransportSocketAddr::from(candidate).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// 候选列表为空时必须报告“未找到地址”，而非任何绑定错误。
    #[test]
    fn empty_candidate_list_yields_no_address_found() {
        match first_bindable([]) {
            Err(IbvTransportError::NoAddressFound) => {}
            other => panic!("期望 NoAddressFound，实际为 {other:?}"),
        }
    }

    /// 第一个候选失败不得短路：第二个候选绑定成功时返回它的地址。
    #[test]
    fn second_candidate_wins_when_first_fails() {
        // TEST-NET-3 地址在本机不可绑定，必然产生 EADDRNOTAVAIL。
        let unbindable: SocketAddr = "203.0.113.1:0".parse().expect("parse addr");
        let loopback: SocketAddr = "127.0.0.1:0".parse().expect("parse addr");
        let another_unbindable: SocketAddr = "198.51.100.1:0".parse().expect("parse addr");

        let resolved = first_bindable([unbindable, loopback, another_unbindable])
            .expect("第二个候选可绑定，解析必须成功");
        assert!(
            resolved.starts_with("127.0.0.1:"),
            "返回的必须是第二个候选的展示形式: {resolved}"
        );
    }

    /// 全部候选失败时返回第一个候选的错误，以错误码区分验证。
    #[test]
    fn first_error_is_retained_when_all_candidates_fail() {
        // 先占住一个回环端口，让第一个候选确定性地得到 EADDRINUSE。
        let occupier = TcpListener::bind("127.0.0.1:0").expect("bind occupier");
        let occupied = occupier.local_addr().expect("local addr");
        let unbindable: SocketAddr = "203.0.113.1:0".parse().expect("parse addr");

        let err = first_bindable([occupied, unbindable])
            .expect_err("两个候选都不可绑定，必须返回错误");
        assert_eq!(
            err.os_error(),
            Some(nix::libc::EADDRINUSE),
            "保留的必须是第一个候选的错误（EADDRINUSE），而非后续候选的 EADDRNOTAVAIL"
        );
    }

    /// 绑定探测必须逐地址族建套接字：IPv6 候选同样可被选中。
    #[test]
    fn ipv6_candidate_is_probed_with_matching_family() {
        let loopback6: SocketAddr = "[::1]:0".parse().expect("parse addr");
        match first_bindable([loopback6]) {
            Ok(resolved) => assert!(
                resolved.starts_with("[::1]:"),
                "IPv6 展示形式必须带方括号: {resolved}"
            ),
            // 无 IPv6 回环的环境里允许失败，但必须是绑定阶段的系统错误。
            Err(IbvTransportError::System { call, .. }) => {
                assert!(call == "bind" || call == "socket");
            }
            Err(other) => panic!("意外的错误类型: {other:?}"),
        }
    }
}
