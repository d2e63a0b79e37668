//! # mesh-transport-ibv
//!
//! ## 定位与职责（Why）
//! - 为 Mesh 点对点通信框架提供基于 verbs 硬件栈（RDMA 网卡）的传输上下文：
//!   探测当前主机的硬件可用性、对外公布兼容性令牌、解析可绑定地址，并以两条
//!   专属线程分别多路复用套接字就绪事件与硬件完成事件。
//! - 硬件缺席被视为正常运行状态：工厂从不因此失败，调用方按可用性回退到
//!   其它后端。
//!
//! ## 架构嵌入（Where）
//! - `context` 是组合根，实现 `mesh-transport` 的上下文契约；
//! - `probe` 负责设备可用性判定（含“缺席 vs 损坏”的分类决策）；
//! - `resolver` 提供按接口名/主机名两条独立的地址解析策略；
//! - `epoll` 与 `reactor` 是上下文拥有的两条事件循环；
//! - `defer` 是反应器对外的唯一跨线程同步原语；
//! - `verbs` 是运行期动态装载的驱动库薄层；
//! - `error` 集中定义错误域（见模块自述）。
//!
//! ## 范围（Trade-offs）
//! - 本 crate 只承载上下文及其事件基础设施；建连/监听状态机、消息分帧与
//!   GPU 通道由同族的其它 crate 提供。

#[cfg(not(target_os = "linux"))]
compile_error!("mesh-transport-ibv 仅支持 Linux：后端依赖 epoll 与 verbs 驱动栈。");

pub mod context;
pub mod defer;
pub mod epoll;
pub mod error;
pub mod reactor;

mod probe;
mod resolver;
mod verbs;

pub use context::IbvContext;
pub use epoll::{EventHandler, Interest};
pub use error::IbvTransportError;
pub use reactor::{CompletionHandler, WorkCompletion};
