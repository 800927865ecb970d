// 保留标识符校验模块
//
// 每个条目携带一个隐藏字段存放其版本标识符；用户语句
// 不得声明、写入或结构性修改该字段。校验在语句边界同步
// 执行，发生在任何锁获取和版本变更之前，因此没有副作用。
// 对表、文档、图元素三种模式统一生效

use crate::transactions::transaction::{TransactionError, TransactionResult};
use crate::values::Properties;

/// 保留的版本标识符字段名
pub const RESERVED_VERSION_KEY: &str = "_vid";

/// 检查单个标识符，命中保留字段名时返回 ReservedIdentifier
pub fn check_identifier(name: &str) -> TransactionResult<()> {
    if name == RESERVED_VERSION_KEY {
        return Err(TransactionError::ReservedIdentifier {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// 检查一组字段名（建表/建文档模式/图元素模式声明时使用）
pub fn check_field_names<'a, I>(names: I) -> TransactionResult<()>
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        check_identifier(name)?;
    }
    Ok(())
}

/// 检查载荷的键（插入/更新语句使用）
pub fn check_properties(props: &Properties) -> TransactionResult<()> {
    check_field_names(props.keys().map(|k| k.as_str()))
}
