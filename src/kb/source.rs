//! KB 数据源抽象
//!
//! 源是一个两表的表格文档：表一为 KB 行，表二为结构登记。
//! 具体解析机制在此 trait 之后（当前实现读 JSON 工作簿文件；
//! xlsx 等读取器可作为另一个 KbSource 实现接入）。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConciergeError;

/// 单个工作表：名字 + 单元格网格（首行约定为表头）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

/// 工作簿：有序工作表集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

/// KB 源：load 返回 None 表示源不可用（文件缺失等），同步按空操作处理
pub trait KbSource: Send + Sync {
    fn load(&self) -> Result<Option<Workbook>, ConciergeError>;
}

/// JSON 工作簿文件源：`{"sheets":[{"name":"...","rows":[["..."]]}]}`
pub struct JsonWorkbookSource {
    path: PathBuf,
}

impl JsonWorkbookSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl KbSource for JsonWorkbookSource {
    fn load(&self) -> Result<Option<Workbook>, ConciergeError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| ConciergeError::KbSource(e.to_string()))?;
        let workbook: Workbook =
            serde_json::from_str(&data).map_err(|e| ConciergeError::KbSource(e.to_string()))?;
        Ok(Some(workbook))
    }
}

/// 内存工作簿源（测试与嵌入式场景）
pub struct StaticWorkbookSource {
    workbook: Workbook,
}

impl StaticWorkbookSource {
    pub fn new(workbook: Workbook) -> Self {
        Self { workbook }
    }
}

impl KbSource for StaticWorkbookSource {
    fn load(&self) -> Result<Option<Workbook>, ConciergeError> {
        Ok(Some(self.workbook.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let source = JsonWorkbookSource::new("/nonexistent/kb.json");
        assert!(source.load().unwrap().is_none());
    }

    #[test]
    fn json_workbook_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(
            &path,
            r#"{"sheets":[{"name":"KB","rows":[["categoria","risposta"],["info","Sì"]]}]}"#,
        )
        .unwrap();

        let workbook = JsonWorkbookSource::new(&path).load().unwrap().unwrap();
        assert_eq!(workbook.sheets.len(), 1);
        assert_eq!(workbook.sheets[0].rows[1][1], "Sì");
    }
}
