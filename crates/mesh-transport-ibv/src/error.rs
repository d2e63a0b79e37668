//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义 verbs 后端对外暴露的错误语义：哪个系统调用、携带什么 OS 错误码，
//!   让调用方（以及排障日志）拿到的信息足以复现故障现场；
//! - 地址解析与设备探测均以显式 `Result` 返回，错误不跨越本 crate 边界抛出。
//!
//! ## 设计要求（What）
//! - `getaddrinfo` 的失败码与 errno 属于不同命名空间，必须以独立变体承载；
//! - “搜索空间耗尽”（无匹配接口、无可绑定地址、候选列表为空）不是系统调用
//!   失败，单独成为一类；
//! - 设备枚举中无法识别的失败不设变体：探测路径直接终止进程（见 `probe`）。

use std::ffi::CStr;
use std::io;

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与系统调用名。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub call: &'static str,
}

pub(crate) const GETIFADDRS: OperationKind = OperationKind {
    code: "mesh.transport.ibv.getifaddrs_failed",
    call: "getifaddrs",
};
pub(crate) const GETHOSTNAME: OperationKind = OperationKind {
    code: "mesh.transport.ibv.gethostname_failed",
    call: "gethostname",
};
pub(crate) const SOCKET: OperationKind = OperationKind {
    code: "mesh.transport.ibv.socket_failed",
    call: "socket",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "mesh.transport.ibv.bind_failed",
    call: "bind",
};
pub(crate) const GET_DEVICE_LIST: OperationKind = OperationKind {
    code: "mesh.transport.ibv.get_device_list_failed",
    call: "ibv_get_device_list",
};
pub(crate) const OPEN_DEVICE: OperationKind = OperationKind {
    code: "mesh.transport.ibv.open_device_failed",
    call: "ibv_open_device",
};
pub(crate) const CREATE_CQ: OperationKind = OperationKind {
    code: "mesh.transport.ibv.create_cq_failed",
    call: "ibv_create_cq",
};
pub(crate) const EPOLL_CREATE: OperationKind = OperationKind {
    code: "mesh.transport.ibv.epoll_create_failed",
    call: "epoll_create1",
};
pub(crate) const EPOLL_CTL: OperationKind = OperationKind {
    code: "mesh.transport.ibv.epoll_ctl_failed",
    call: "epoll_ctl",
};
pub(crate) const THREAD_SPAWN: OperationKind = OperationKind {
    code: "mesh.transport.ibv.thread_spawn_failed",
    call: "pthread_create",
};

/// verbs 后端的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“哪个调用、什么错误码”结构化保留，而不是折叠成一行
///   文本；地址解析的首错保留策略依赖错误之间可区分。
/// - **契约 (What)**：
///   - `System` 携带失败的系统调用名与原始 `io::Error`（errno 经
///     [`IbvTransportError::os_error`] 可取回）；
///   - `NameResolution` 携带 `getaddrinfo` 返回码，命名空间独立于 errno；
///   - `NoAddressFound` 表示搜索空间耗尽，没有底层调用失败可归因。
/// - **取舍 (Trade-offs)**：`System` 持有 `io::Error` 导致整个枚举不可
///   `Clone`；换来的是错误码与内核附加信息的完整透传。
#[derive(Debug, Error)]
pub enum IbvTransportError {
    /// 具名系统调用失败。
    #[error("系统调用 {call} 失败: {source}")]
    System {
        call: &'static str,
        #[source]
        source: io::Error,
    },
    /// 主机名解析失败，`code` 为 `getaddrinfo` 的返回码。
    #[error("主机名解析失败 (getaddrinfo 返回 {code}): {detail}")]
    NameResolution { code: i32, detail: String },
    /// 搜索空间耗尽：无匹配接口、无可绑定地址或候选列表为空。
    #[error("未找到可用的本地地址")]
    NoAddressFound,
}

impl IbvTransportError {
    /// 按操作标签构造系统调用错误。
    pub(crate) fn system(kind: OperationKind, source: io::Error) -> Self {
        Self::System {
            call: kind.call,
            source,
        }
    }

    /// 由 `getaddrinfo` 返回码构造解析错误，文案取自 `gai_strerror`。
    pub(crate) fn name_resolution(code: i32) -> Self {
        // gai_strerror 返回静态字符串，无需调用方释放。
        let detail = unsafe { CStr::from_ptr(nix::libc::gai_strerror(code)) }
            .to_string_lossy()
            .into_owned();
        Self::NameResolution { code, detail }
    }

    /// 返回 `System` 变体携带的原始 OS 错误码。
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::System { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// 不可恢复的配置类故障：记录日志后终止进程。
///
/// 仅用于“驱动库可装载但枚举/初始化损坏”的场景——继续运行会让上层在一个
/// 不一致的传输层上工作，失败必须响亮。
pub(crate) fn fatal(kind: OperationKind, source: io::Error) -> ! {
    tracing::error!(
        code = kind.code,
        call = kind.call,
        error = %source,
        "verbs 传输层遇到不可恢复的配置故障"
    );
    panic!("{} 失败且无法归类为硬件缺席: {source}", kind.call);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `System` 变体必须原样透传 errno，供首错保留策略区分错误来源。
    #[test]
    fn system_error_preserves_errno() {
        let err = IbvTransportError::system(
            BIND,
            io::Error::from_raw_os_error(nix::libc::EADDRINUSE),
        );
        assert_eq!(err.os_error(), Some(nix::libc::EADDRINUSE));
        let text = err.to_string();
        assert!(text.contains("bind"), "错误文案应包含系统调用名: {text}");
    }

    /// 解析错误与 errno 命名空间独立，`os_error` 不得混淆两者。
    #[test]
    fn name_resolution_has_distinct_namespace() {
        let err = IbvTransportError::name_resolution(nix::libc::EAI_NONAME);
        assert_eq!(err.os_error(), None);
        match err {
            IbvTransportError::NameResolution { code, .. } => {
                assert_eq!(code, nix::libc::EAI_NONAME);
            }
            other => panic!("期望 NameResolution 变体，实际为 {other:?}"),
        }
    }
}
