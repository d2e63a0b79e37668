use core::fmt;
use std::net::{IpAddr, SocketAddr};

/// `TransportSocketAddr` 是各后端共享的 Socket 地址表达。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - **统一展示格式**：地址解析结果最终以字符串形式交给监听器/连接器使用，
///   各后端必须输出完全一致的展示形式（IPv4 `a.b.c.d:port`、IPv6
///   `[..]:port`），避免对端解析歧义。
/// - **封装标准库类型**：调用方不直接依赖 `std::net::SocketAddr`，为未来在
///   地址中附加后端特有信息（如 verbs 设备号）预留扩展点。
///
/// ## 契约（What）
/// - `Display` 输出即对外协商使用的展示字符串；IPv6 一律加方括号；
/// - 端口可以为 0：由 `getifaddrs` 枚举得到的接口地址不携带端口信息，
///   调用方将其作为绑定模板使用；
/// - 与 `std::net::SocketAddr` 可双向无损转换。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportSocketAddr(SocketAddr);

impl TransportSocketAddr {
    /// 由 IP 与端口构造地址。
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// 返回 IP 部分。
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// 返回端口部分。
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// 是否为 IPv4 地址。
    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 标准库的 Display 已满足展示约定：IPv4 无括号、IPv6 带方括号。
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<SocketAddr> for TransportSocketAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<TransportSocketAddr> for SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        addr.0
    }
}
