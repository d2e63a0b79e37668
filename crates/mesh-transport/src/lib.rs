#![deny(unsafe_code)]

//! # mesh-transport
//!
//! ## 定位与职责（Why）
//! - 为 Mesh 运行时的各类点对点传输后端（TCP、共享内存、verbs 硬件栈等）提供
//!   共同语言：统一的地址表达、对等兼容性令牌与上下文生命周期契约。
//! - 分布式张量计算框架在建连前需要先交换兼容性令牌、再挑选后端；本 crate 把
//!   这一协商面从具体实现中抽离，保证后端可以热插拔替换而无需重编调用方。
//!
//! ## 架构嵌入（Where）
//! - `addr` 模块提供展示形式统一的 Socket 地址包装；
//! - `descriptor` 模块定义对等协商使用的域描述符令牌及其匹配规则；
//! - `context` 模块定义传输上下文的生命周期契约，由 `mesh-transport-ibv` 等
//!   实现 crate 落地。
//!
//! ## 设计取舍（Trade-offs）
//! - 本工作区面向 std 环境，地址类型直接复用 `core::net`，不再为 `no_std`
//!   维护平行的字节数组表示；
//! - 契约层不引入任何第三方依赖，保持实现 crate 的依赖图完全自主。

pub mod addr;
pub mod context;
pub mod descriptor;

pub use addr::TransportSocketAddr;
pub use context::TransportContext;
pub use descriptor::DomainDescriptor;
