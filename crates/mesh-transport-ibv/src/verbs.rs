//! verbs 驱动库的动态装载薄层。
//!
//! # 模块定位（Why）
//! - **装载即探测**：verbs 驱动库是否存在本身就是硬件可用性的第一道判据，
//!   因此不能使用链接期绑定——在无硬件主机上必须可以正常启动并优雅降级。
//! - **最小暴露面**：本模块只覆盖上下文生命周期真正需要的入口（设备枚举、
//!   打开设备、完成队列的创建与轮询），完整的 verbs 绑定不在职责内。
//!
//! # 设计要点（How）
//! - 通过 `libloading` 在运行期装载 `libibverbs.so.1` 并解析导出符号；
//!   原始符号与 `Library` 同存于一个结构体，保证析构顺序正确。
//! - `ibv_poll_cq` 在驱动头文件中是内联函数，真正的入口位于每个设备上下文
//!   的操作表中；本模块按公开 ABI 声明操作表前缀并经由函数指针调用。
//! - 所有 OS 拥有的枚举资源（设备列表、设备上下文、完成队列）都包装为
//!   RAII 类型，任何退出路径都会确定性释放。

use std::ffi::CStr;
use std::io;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use libloading::Library;
use libloading::os::unix::Symbol as RawSymbol;

/// 驱动库的装载名；跟随发行版 soname 而非开发符号链接。
pub(crate) const DRIVER_LIBRARY: &str = "libibverbs.so.1";

/// 单次轮询最多取回的完成记录条数。
pub(crate) const COMPLETION_POLL_BATCH: usize = 64;

/// 完成队列深度；覆盖单设备上并发在途操作的常见上限。
pub(crate) const COMPLETION_QUEUE_DEPTH: c_int = 1000;

#[allow(non_camel_case_types)]
pub(crate) mod ffi {
    use super::{c_int, c_void};

    /// 设备句柄，仅经指针传递。
    #[repr(C)]
    pub struct ibv_device {
        _opaque: [u8; 0],
    }

    /// 完成事件通道，本后端不使用，仅出现在签名中。
    #[repr(C)]
    pub struct ibv_comp_channel {
        _opaque: [u8; 0],
    }

    /// 设备上下文操作表的前缀布局。
    ///
    /// 按驱动头文件的公开 ABI，前 11 个槽位为兼容占位与内存窗口入口，
    /// 第 12 个槽位即 `poll_cq`。本后端只经由该前缀访问，后续槽位不声明。
    #[repr(C)]
    pub struct ibv_context_ops {
        _compat_head: [*mut c_void; 11],
        pub poll_cq: Option<unsafe extern "C" fn(*mut ibv_cq, c_int, *mut ibv_wc) -> c_int>,
        pub req_notify_cq: Option<unsafe extern "C" fn(*mut ibv_cq, c_int) -> c_int>,
    }

    /// 设备上下文的头部布局；操作表之后的字段不访问。
    #[repr(C)]
    pub struct ibv_context {
        pub device: *mut ibv_device,
        pub ops: ibv_context_ops,
    }

    /// 完成队列的头部布局；仅读取所属上下文指针。
    #[repr(C)]
    pub struct ibv_cq {
        pub context: *mut ibv_context,
    }

    /// 完成记录；字段顺序与驱动头文件一致。
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct ibv_wc {
        pub wr_id: u64,
        pub status: c_int,
        pub opcode: c_int,
        pub vendor_err: u32,
        pub byte_len: u32,
        pub imm_data: u32,
        pub qp_num: u32,
        pub src_qp: u32,
        pub wc_flags: u32,
        pub pkey_index: u16,
        pub slid: u16,
        pub sl: u8,
        pub dlid_path_bits: u8,
    }

    /// 完成状态：成功。
    pub const IBV_WC_SUCCESS: c_int = 0;
}

type GetDeviceListFn = unsafe extern "C" fn(*mut c_int) -> *mut *mut ffi::ibv_device;
type FreeDeviceListFn = unsafe extern "C" fn(*mut *mut ffi::ibv_device);
type GetDeviceNameFn = unsafe extern "C" fn(*mut ffi::ibv_device) -> *const c_char;
type OpenDeviceFn = unsafe extern "C" fn(*mut ffi::ibv_device) -> *mut ffi::ibv_context;
type CloseDeviceFn = unsafe extern "C" fn(*mut ffi::ibv_context) -> c_int;
type CreateCqFn = unsafe extern "C" fn(
    *mut ffi::ibv_context,
    c_int,
    *mut c_void,
    *mut ffi::ibv_comp_channel,
    c_int,
) -> *mut ffi::ibv_cq;
type DestroyCqFn = unsafe extern "C" fn(*mut ffi::ibv_cq) -> c_int;

/// 已装载的 verbs 驱动库及本后端使用的全部入口。
///
/// # 契约（What）
/// - `load` 失败即表示驱动库缺席，调用方应将后端标记为不可用；
/// - 结构体内原始符号引用 `_library` 的映射，`_library` 字段置于末尾以
///   保证最后析构。
pub(crate) struct VerbsLibrary {
    get_device_list: RawSymbol<GetDeviceListFn>,
    free_device_list: RawSymbol<FreeDeviceListFn>,
    get_device_name: RawSymbol<GetDeviceNameFn>,
    open_device: RawSymbol<OpenDeviceFn>,
    close_device: RawSymbol<CloseDeviceFn>,
    create_cq: RawSymbol<CreateCqFn>,
    destroy_cq: RawSymbol<DestroyCqFn>,
    _library: Library,
}

impl VerbsLibrary {
    /// 装载驱动库并解析全部所需符号。
    pub(crate) fn load() -> Result<Arc<Self>, libloading::Error> {
        unsafe {
            let library = Library::new(DRIVER_LIBRARY)?;
            let get_device_list = library
                .get::<GetDeviceListFn>(b"ibv_get_device_list\0")?
                .into_raw();
            let free_device_list = library
                .get::<FreeDeviceListFn>(b"ibv_free_device_list\0")?
                .into_raw();
            let get_device_name = library
                .get::<GetDeviceNameFn>(b"ibv_get_device_name\0")?
                .into_raw();
            let open_device = library
                .get::<OpenDeviceFn>(b"ibv_open_device\0")?
                .into_raw();
            let close_device = library
                .get::<CloseDeviceFn>(b"ibv_close_device\0")?
                .into_raw();
            let create_cq = library.get::<CreateCqFn>(b"ibv_create_cq\0")?.into_raw();
            let destroy_cq = library.get::<DestroyCqFn>(b"ibv_destroy_cq\0")?.into_raw();
            Ok(Arc::new(Self {
                get_device_list,
                free_device_list,
                get_device_name,
                open_device,
                close_device,
                create_cq,
                destroy_cq,
                _library: library,
            }))
        }
    }

    /// 枚举当前主机上的 verbs 设备。
    ///
    /// # 契约（What）
    /// - 失败时返回携带 errno 的 `io::Error`，由探测层判别“内核模块未装载”
    ///   与真实配置故障；
    /// - 成功返回的 [`DeviceList`] 在析构时调用 `ibv_free_device_list`。
    pub(crate) fn enumerate_devices(self: &Arc<Self>) -> io::Result<DeviceList> {
        let mut count: c_int = 0;
        let devices = unsafe { (*self.get_device_list)(&mut count) };
        if devices.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(DeviceList {
            devices,
            count: count.max(0) as usize,
            lib: Arc::clone(self),
        })
    }
}

/// OS 拥有的设备列表，RAII 释放。
pub(crate) struct DeviceList {
    devices: *mut *mut ffi::ibv_device,
    count: usize,
    lib: Arc<VerbsLibrary>,
}

impl DeviceList {
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 返回第 `index` 个设备句柄。
    pub(crate) fn get(&self, index: usize) -> Option<*mut ffi::ibv_device> {
        if index < self.count {
            Some(unsafe { *self.devices.add(index) })
        } else {
            None
        }
    }

    /// 返回第 `index` 个设备的名字，用于诊断日志。
    pub(crate) fn name(&self, index: usize) -> Option<String> {
        let device = self.get(index)?;
        let name = unsafe { (*self.lib.get_device_name)(device) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { (*self.lib.free_device_list)(self.devices) };
    }
}

// 设备列表仅承载只读句柄数组，跨线程移交归属是安全的。
unsafe impl Send for DeviceList {}

/// 已打开的设备上下文，RAII 关闭。
pub(crate) struct DeviceContext {
    raw: *mut ffi::ibv_context,
    lib: Arc<VerbsLibrary>,
}

impl DeviceContext {
    /// 打开指定设备。
    pub(crate) fn open(
        lib: &Arc<VerbsLibrary>,
        device: *mut ffi::ibv_device,
    ) -> io::Result<Self> {
        let raw = unsafe { (*lib.open_device)(device) };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            raw,
            lib: Arc::clone(lib),
        })
    }

    /// 在该设备上创建完成队列。
    ///
    /// 返回的队列必须先于本上下文析构；所有权编排由反应器负责。
    pub(crate) fn create_completion_queue(&self, depth: c_int) -> io::Result<CompletionQueue> {
        let raw = unsafe {
            (*self.lib.create_cq)(
                self.raw,
                depth,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            )
        };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionQueue {
            raw,
            lib: Arc::clone(&self.lib),
        })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let rc = unsafe { (*self.lib.close_device)(self.raw) };
        if rc != 0 {
            tracing::warn!(rc, "ibv_close_device 返回非零，设备资源可能未完全回收");
        }
    }
}

// 上下文句柄只在反应器线程上使用；移交进该线程是安全的。
unsafe impl Send for DeviceContext {}

/// 硬件完成队列，RAII 销毁。
pub(crate) struct CompletionQueue {
    raw: *mut ffi::ibv_cq,
    lib: Arc<VerbsLibrary>,
}

impl CompletionQueue {
    /// 非阻塞轮询，最多填充 `out.len()` 条完成记录，返回实际条数。
    pub(crate) fn poll(&self, out: &mut [ffi::ibv_wc]) -> io::Result<usize> {
        let context = unsafe { (*self.raw).context };
        let poll_cq = unsafe { (*context).ops.poll_cq }.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "驱动操作表缺少 poll_cq 入口")
        })?;
        let rc = unsafe { poll_cq(self.raw, out.len() as c_int, out.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::other(format!("ibv_poll_cq 返回 {rc}")));
        }
        Ok(rc as usize)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let rc = unsafe { (*self.lib.destroy_cq)(self.raw) };
        if rc != 0 {
            tracing::warn!(rc, "ibv_destroy_cq 返回非零，完成队列可能未完全回收");
        }
    }
}

// 完成队列由反应器线程独占轮询。
unsafe impl Send for CompletionQueue {}
