//! 设备可用性探测。
//!
//! # 模块定位（Why）
//! - 本组件的核心判断只有一个：把“硬件缺席”（预期的运行时状态，回退到其它
//!   后端即可）与“硬件在场但配置损坏”（值得响亮失败的故障）区分开。
//! - 可恢复集合是封闭的：只有明确识别的原因才走降级路径，未识别的失败一律
//!   落入致命分支，绝不静默扩大可恢复范围。

use std::sync::Arc;

use crate::error;
use crate::verbs::{DeviceList, VerbsLibrary};

/// 探测结论。
pub(crate) enum ProbeOutcome {
    /// 硬件/驱动栈缺席：正常的降级路径，仅留诊断日志。
    Unavailable,
    /// 栈完整可用，携带驱动库与完整设备列表。
    Viable {
        lib: Arc<VerbsLibrary>,
        devices: DeviceList,
    },
}

/// 按序执行三道检查，任何一道不过即短路返回。
///
/// # 契约（What）
/// - 本函数对硬件缺席**从不失败**——装载失败、内核模块未装载、零设备都只
///   产生 `Unavailable`；
/// - 唯一的例外：设备枚举以未识别的错误码失败时终止进程（驱动库可装载但
///   枚举损坏，说明主机配置真实出错，继续运行只会掩盖故障）。
pub(crate) fn probe_devices() -> ProbeOutcome {
    // 检查一：驱动库能否装载。
    let lib = match VerbsLibrary::load() {
        Ok(lib) => lib,
        Err(err) => {
            tracing::debug!(error = %err, "verbs 驱动库无法装载，后端不可用");
            return ProbeOutcome::Unavailable;
        }
    };

    // 检查二：设备枚举。ENOSYS 表示内核模块未装载，属于预期缺席。
    let devices = match lib.enumerate_devices() {
        Ok(devices) => devices,
        Err(err) if err.raw_os_error() == Some(nix::libc::ENOSYS) => {
            tracing::debug!("verbs 内核模块未装载，后端不可用");
            return ProbeOutcome::Unavailable;
        }
        Err(err) => error::fatal(error::GET_DEVICE_LIST, err),
    };

    // 检查三：至少一台设备。
    if devices.is_empty() {
        tracing::debug!("未发现任何 verbs 设备，后端不可用");
        return ProbeOutcome::Unavailable;
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let names: Vec<String> = (0..devices.len())
            .filter_map(|index| devices.name(index))
            .collect();
        tracing::debug!(count = devices.len(), devices = ?names, "verbs 设备探测通过");
    }

    ProbeOutcome::Viable { lib, devices }
}
