// 命名空间目录模块
//
// 管理多模型引擎的命名空间（表/文档集合/图空间共用同一抽象）：
// - 每个命名空间在创建时固定并发控制模式（MVCC 或 S2PL），之后不可更改
// - 未显式指定模式时使用进程级默认模式
// - 所有结构变更先经过保留标识符校验，校验失败不产生任何变更

use crate::transactions::identifier::{check_field_names, check_identifier};
use crate::transactions::transaction::{TransactionError, TransactionResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// 命名空间的并发控制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// 多版本并发控制：写入不阻塞读取，提交时首个提交者获胜
    Mvcc,
    /// 严格两阶段锁：读写都通过锁管理器，持锁到事务结束
    S2pl,
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMode::Mvcc => write!(f, "MVCC"),
            ConcurrencyMode::S2pl => write!(f, "S2PL"),
        }
    }
}

impl ConcurrencyMode {
    /// 解析配置中的模式名（大小写不敏感）
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "MVCC" => Some(ConcurrencyMode::Mvcc),
            "S2PL" => Some(ConcurrencyMode::S2pl),
            _ => None,
        }
    }
}

/// 命名空间元数据
#[derive(Debug, Clone)]
pub struct Namespace {
    /// 命名空间名称
    pub name: String,
    /// 并发控制模式（创建时固定）
    pub mode: ConcurrencyMode,
    /// 声明的字段
    pub fields: Vec<String>,
}

/// 命名空间目录
#[derive(Debug)]
pub struct Catalog {
    /// 已注册的命名空间
    namespaces: RwLock<HashMap<String, Namespace>>,
    /// 进程级默认模式
    default_mode: ConcurrencyMode,
}

impl Catalog {
    /// 创建目录
    pub fn new(default_mode: ConcurrencyMode) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            default_mode,
        }
    }

    /// 进程级默认模式
    pub fn default_mode(&self) -> ConcurrencyMode {
        self.default_mode
    }

    /// 创建命名空间
    ///
    /// mode 为 None 时使用默认模式；字段名先整体校验，
    /// 任何字段命中保留标识符则整个创建不生效
    pub fn create_namespace(
        &self,
        name: &str,
        fields: &[&str],
        mode: Option<ConcurrencyMode>,
    ) -> TransactionResult<()> {
        check_identifier(name)?;
        check_field_names(fields.iter().copied())?;

        let mut namespaces = self.namespaces.write().unwrap();
        if namespaces.contains_key(name) {
            return Err(TransactionError::NamespaceAlreadyExists(name.to_string()));
        }
        let mode = mode.unwrap_or(self.default_mode);
        tracing::debug!(namespace = name, %mode, "namespace created");
        namespaces.insert(
            name.to_string(),
            Namespace {
                name: name.to_string(),
                mode,
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        );
        Ok(())
    }

    /// 查询命名空间的并发控制模式
    pub fn mode_of(&self, name: &str) -> TransactionResult<ConcurrencyMode> {
        self.namespaces
            .read()
            .unwrap()
            .get(name)
            .map(|ns| ns.mode)
            .ok_or_else(|| TransactionError::NamespaceNotFound(name.to_string()))
    }

    /// 查询命名空间声明的字段
    pub fn fields(&self, name: &str) -> TransactionResult<Vec<String>> {
        self.namespaces
            .read()
            .unwrap()
            .get(name)
            .map(|ns| ns.fields.clone())
            .ok_or_else(|| TransactionError::NamespaceNotFound(name.to_string()))
    }

    /// 为命名空间增加字段
    pub fn add_field(&self, name: &str, field: &str) -> TransactionResult<()> {
        check_identifier(field)?;
        let mut namespaces = self.namespaces.write().unwrap();
        let ns = namespaces
            .get_mut(name)
            .ok_or_else(|| TransactionError::NamespaceNotFound(name.to_string()))?;
        if !ns.fields.iter().any(|f| f == field) {
            ns.fields.push(field.to_string());
        }
        Ok(())
    }

    /// 重命名字段（新旧名都要通过保留标识符校验）
    pub fn rename_field(&self, name: &str, from: &str, to: &str) -> TransactionResult<()> {
        check_identifier(from)?;
        check_identifier(to)?;
        let mut namespaces = self.namespaces.write().unwrap();
        let ns = namespaces
            .get_mut(name)
            .ok_or_else(|| TransactionError::NamespaceNotFound(name.to_string()))?;
        if let Some(slot) = ns.fields.iter_mut().find(|f| f.as_str() == from) {
            *slot = to.to_string();
        }
        Ok(())
    }

    /// 删除字段
    pub fn drop_field(&self, name: &str, field: &str) -> TransactionResult<()> {
        check_identifier(field)?;
        let mut namespaces = self.namespaces.write().unwrap();
        let ns = namespaces
            .get_mut(name)
            .ok_or_else(|| TransactionError::NamespaceNotFound(name.to_string()))?;
        ns.fields.retain(|f| f != field);
        Ok(())
    }

    /// 命名空间数量
    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::identifier::RESERVED_VERSION_KEY;

    #[test]
    fn test_create_namespace_uses_default_mode() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        catalog.create_namespace("docs", &["name"], None).unwrap();
        assert_eq!(catalog.mode_of("docs").unwrap(), ConcurrencyMode::Mvcc);
    }

    #[test]
    fn test_create_namespace_with_explicit_mode() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        catalog
            .create_namespace("accounts", &["balance"], Some(ConcurrencyMode::S2pl))
            .unwrap();
        assert_eq!(catalog.mode_of("accounts").unwrap(), ConcurrencyMode::S2pl);
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        catalog.create_namespace("docs", &[], None).unwrap();
        assert!(matches!(
            catalog.create_namespace("docs", &[], None),
            Err(TransactionError::NamespaceAlreadyExists(_))
        ));
    }

    #[test]
    fn test_unknown_namespace() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        assert!(matches!(
            catalog.mode_of("missing"),
            Err(TransactionError::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn test_reserved_field_blocks_creation_entirely() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        let result = catalog.create_namespace("docs", &["name", RESERVED_VERSION_KEY], None);
        assert!(matches!(
            result,
            Err(TransactionError::ReservedIdentifier { .. })
        ));
        // 校验失败时没有部分生效的命名空间
        assert_eq!(catalog.namespace_count(), 0);
    }

    #[test]
    fn test_reserved_field_blocks_schema_changes() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        catalog.create_namespace("docs", &["name"], None).unwrap();

        assert!(catalog.add_field("docs", RESERVED_VERSION_KEY).is_err());
        assert!(catalog
            .rename_field("docs", "name", RESERVED_VERSION_KEY)
            .is_err());
        assert!(catalog.drop_field("docs", RESERVED_VERSION_KEY).is_err());
        assert_eq!(catalog.fields("docs").unwrap(), vec!["name".to_string()]);
    }

    #[test]
    fn test_field_operations() {
        let catalog = Catalog::new(ConcurrencyMode::Mvcc);
        catalog.create_namespace("docs", &["name"], None).unwrap();

        catalog.add_field("docs", "age").unwrap();
        catalog.rename_field("docs", "age", "years").unwrap();
        assert_eq!(
            catalog.fields("docs").unwrap(),
            vec!["name".to_string(), "years".to_string()]
        );
        catalog.drop_field("docs", "years").unwrap();
        assert_eq!(catalog.fields("docs").unwrap(), vec!["name".to_string()]);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ConcurrencyMode::parse("mvcc"), Some(ConcurrencyMode::Mvcc));
        assert_eq!(ConcurrencyMode::parse("S2PL"), Some(ConcurrencyMode::S2pl));
        assert_eq!(ConcurrencyMode::parse("serial"), None);
    }
}
