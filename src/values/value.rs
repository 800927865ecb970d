// 值模型
//
// 多模型引擎共享的属性值类型：表的列值、文档的字段值、
// 图元素的属性值都使用同一套 Value

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Text(String),
    Float(f64),
    Null,
}

impl Value {
    /// 判断是否为空值
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 以整数读取（类型不匹配返回 None）
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// 以文本读取
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// 类型名称（用于错误信息）
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "INT",
            Value::Bool(_) => "BOOL",
            Value::Text(_) => "TEXT",
            Value::Float(_) => "FLOAT",
            Value::Null => "NULL",
        }
    }
}

pub type Properties = HashMap<String, Value>;
