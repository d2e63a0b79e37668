use core::fmt;

/// `DomainDescriptor` 是两个对等进程在尝试建连前交换的兼容性令牌。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每个传输上下文对外公布一个不透明令牌，描述“本进程通过该后端可达的
///   通信域”；两端令牌匹配，框架才会尝试用该后端建连。
/// - 令牌语义由各后端自行定义：它可以编码机器标识（共享内存后端）、网段
///   信息（TCP 后端），也可以退化为固定通配（无法探测域身份的硬件后端）。
///
/// ## 契约（What）
/// - 令牌按字节精确相等进行比较，框架不理解其内部结构；
/// - **空令牌表示上下文不可用**，永远不与任何令牌匹配——包括另一个空令牌。
///   不可用上下文因此天然退出协商，调用方无需额外分支；
/// - 令牌在上下文构造时生成，之后不可变。
///
/// ## 取舍（Trade-offs）
/// - 通配令牌意味着“弱兼容性检查”：两端只要都宣告可用即认为互通。后端若
///   无法从硬件栈得到真实的域身份，应保留该行为而非自行发明标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DomainDescriptor(String);

impl DomainDescriptor {
    /// 以给定令牌内容构造描述符。
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// 构造表示“上下文不可用”的空描述符。
    pub fn unavailable() -> Self {
        Self(String::new())
    }

    /// 返回令牌内容。
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 令牌是否为空（即上下文不可用）。
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 判断两个描述符是否允许建连。
    ///
    /// # 契约（What）
    /// - 非空令牌之间按精确相等判定；
    /// - 任意一侧为空即判为不匹配，空令牌之间同样不匹配。
    pub fn compatible(&self, other: &DomainDescriptor) -> bool {
        !self.0.is_empty() && self.0 == other.0
    }
}

impl fmt::Display for DomainDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 两个可用上下文的相同令牌必须匹配。
    #[test]
    fn equal_tokens_are_compatible() {
        let lhs = DomainDescriptor::new("ibv:*");
        let rhs = DomainDescriptor::new("ibv:*");
        assert!(lhs.compatible(&rhs));
    }

    /// 不同令牌不匹配，即便前缀一致。
    #[test]
    fn different_tokens_are_rejected() {
        let lhs = DomainDescriptor::new("ibv:*");
        let rhs = DomainDescriptor::new("tcp:10.0.0.0/8");
        assert!(!lhs.compatible(&rhs));
    }

    /// 空令牌不与任何令牌匹配——包括另一个空令牌。
    #[test]
    fn empty_token_never_matches() {
        let empty = DomainDescriptor::unavailable();
        let viable = DomainDescriptor::new("ibv:*");
        assert!(!empty.compatible(&viable), "空令牌不得匹配可用令牌");
        assert!(!viable.compatible(&empty), "可用令牌不得匹配空令牌");
        assert!(
            !empty.compatible(&DomainDescriptor::unavailable()),
            "两个空令牌之间也必须判为不匹配"
        );
    }

    /// 字节级相等语义保持不变，供日志与断言使用。
    #[test]
    fn raw_equality_stays_bytewise() {
        assert_eq!(
            DomainDescriptor::unavailable(),
            DomainDescriptor::new("")
        );
    }
}
