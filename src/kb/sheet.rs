//! 表格解析：表头解析、KB 行模式、结构登记
//!
//! 表头按规范化 + 同义词表映射到固定字段；解析不出必需的 answer 列时
//! 回退为按位置取列（fail-closed，不做猜测式映射）。

use std::collections::HashMap;

use super::source::Sheet;

/// KB 行的显式模式：answer 必填，其余可缺
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct KbRow {
    pub category: Option<String>,
    pub unit: Option<String>,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub answer: String,
}

/// 规范字段名，嵌入文本与行哈希都按这个顺序
pub const FIELDS: [&str; 5] = ["category", "unit", "scope", "description", "answer"];

impl KbRow {
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "category" => self.category.as_deref(),
            "unit" => self.unit.as_deref(),
            "scope" => self.scope.as_deref(),
            "description" => self.description.as_deref(),
            "answer" => Some(self.answer.as_str()),
            _ => None,
        }
    }
}

/// 解析后的列映射；fallback 为 true 表示表头没认出来、按固定位置取列
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    pub category: Option<usize>,
    pub unit: Option<usize>,
    pub scope: Option<usize>,
    pub description: Option<usize>,
    pub answer: Option<usize>,
    pub fallback: bool,
    /// 规范字段 -> 命中的原始表头（inspect 用）
    pub resolved: HashMap<String, String>,
}

/// 表头规范化：小写并去掉空白与常见分隔符
fn normalize_header(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .replace([' ', '/', '\\', '-', '_'], "")
}

/// 同义词表：规范化表头 -> 规范字段
fn canonical_field(norm: &str) -> Option<&'static str> {
    match norm {
        "categoria" | "category" => Some("category"),
        "appartamentostanza" | "appartamentostanze" | "appartamento" | "stanza" | "camera"
        | "struttura" | "property" | "unit" => Some("unit"),
        "ambito" | "scope" => Some("scope"),
        "descrizione" | "description" => Some("description"),
        "risposta" | "answer" | "response" => Some("answer"),
        _ => None,
    }
}

/// 把原始表头解析成列映射
///
/// 只有 answer 列解析不出来时才整体放弃表头、按固定位置
/// （category, unit, scope, description, answer = 0..4）取列。
pub fn resolve_headers(headers: &[String]) -> ColumnMap {
    let mut map = ColumnMap::default();

    for (i, h) in headers.iter().enumerate() {
        let Some(field) = canonical_field(&normalize_header(h)) else {
            continue;
        };
        let slot = match field {
            "category" => &mut map.category,
            "unit" => &mut map.unit,
            "scope" => &mut map.scope,
            "description" => &mut map.description,
            _ => &mut map.answer,
        };
        if slot.is_none() {
            *slot = Some(i);
            map.resolved.insert(field.to_string(), h.clone());
        }
    }

    if map.answer.is_none() {
        map = ColumnMap {
            category: Some(0),
            unit: Some(1),
            scope: Some(2),
            description: Some(3),
            answer: Some(4),
            fallback: true,
            resolved: FIELDS
                .iter()
                .enumerate()
                .map(|(i, f)| (f.to_string(), headers.get(i).cloned().unwrap_or_default()))
                .collect(),
        };
    }

    map
}

fn cell(row: &[String], idx: Option<usize>) -> Option<String> {
    let i = idx?;
    let value = row.get(i)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// 按列映射解析 KB 行：跳过全空行，丢弃没有非空 answer 的行
pub fn parse_kb_rows(sheet: &Sheet, map: &ColumnMap) -> Vec<KbRow> {
    sheet
        .rows
        .iter()
        .skip(1)
        .filter(|row| row.iter().any(|v| !v.trim().is_empty()))
        .filter_map(|row| {
            let answer = cell(row, map.answer)?;
            Some(KbRow {
                category: cell(row, map.category),
                unit: cell(row, map.unit),
                scope: cell(row, map.scope),
                description: cell(row, map.description),
                answer,
            })
        })
        .collect()
}

/// 结构登记：名字 -> 属性记录，可选的 id -> 名字二级索引
#[derive(Debug, Clone, Default)]
pub struct PropertyRegistry {
    by_name: HashMap<String, HashMap<String, String>>,
    by_id: HashMap<String, String>,
}

impl PropertyRegistry {
    /// 按 id 查记录，查不到再按名字；都查不到返回 None（id 原样当名字用）
    pub fn record(&self, hint: &str) -> Option<&HashMap<String, String>> {
        if let Some(name) = self.by_id.get(hint) {
            if let Some(record) = self.by_name.get(name) {
                return Some(record);
            }
        }
        self.by_name.get(hint)
    }

    /// id -> 展示名；未登记的 id 原样透传
    pub fn display_name<'a>(&'a self, hint: &'a str) -> &'a str {
        self.by_id.get(hint).map(String::as_str).unwrap_or(hint)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn is_name_header(norm: &str) -> bool {
    norm.contains("nome") || norm.contains("name")
}

fn is_id_header(norm: &str) -> bool {
    norm == "id" || norm.starts_with("id") || norm.ends_with("id")
}

/// 通用读登记表：首行表头，记录按"像名字的列"为键；
/// 发现"像 id 的列"时再建 id -> 名字索引。没有名字列时退回第一列当键。
pub fn parse_registry(sheet: &Sheet) -> PropertyRegistry {
    let Some(headers) = sheet.rows.first() else {
        return PropertyRegistry::default();
    };

    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let name_col = normalized
        .iter()
        .position(|n| is_name_header(n))
        .unwrap_or(0);
    let id_col = normalized
        .iter()
        .position(|n| is_id_header(n))
        .filter(|&i| i != name_col);

    let mut registry = PropertyRegistry::default();
    for row in sheet.rows.iter().skip(1) {
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let Some(key) = cell(row, Some(name_col)) else {
            continue;
        };

        let mut record = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            if h.trim().is_empty() {
                continue;
            }
            if let Some(value) = cell(row, Some(i)) {
                record.insert(h.trim().to_string(), value);
            }
        }

        if let Some(id) = cell(row, id_col) {
            registry.by_id.insert(id, key.clone());
        }
        registry.by_name.insert(key, record);
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(rows: Vec<Vec<&str>>) -> Sheet {
        Sheet {
            name: "test".to_string(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    #[test]
    fn headers_resolve_by_synonym() {
        let headers: Vec<String> = ["Categoria", "Appartamento /stanza", "ambito", "descrizione", "risposta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = resolve_headers(&headers);
        assert!(!map.fallback);
        assert_eq!(map.category, Some(0));
        assert_eq!(map.unit, Some(1));
        assert_eq!(map.answer, Some(4));
        assert_eq!(map.resolved.get("answer").map(String::as_str), Some("risposta"));
    }

    #[test]
    fn english_headers_resolve_in_any_order() {
        let headers: Vec<String> = ["Answer", "Category", "Property"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = resolve_headers(&headers);
        assert!(!map.fallback);
        assert_eq!(map.answer, Some(0));
        assert_eq!(map.category, Some(1));
        assert_eq!(map.unit, Some(2));
        assert_eq!(map.scope, None);
    }

    #[test]
    fn missing_answer_header_falls_back_to_positions() {
        let headers: Vec<String> = ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();
        let map = resolve_headers(&headers);
        assert!(map.fallback);
        assert_eq!(map.answer, Some(4));
        assert_eq!(map.category, Some(0));
    }

    #[test]
    fn rows_without_answer_are_discarded() {
        let s = sheet(vec![
            vec!["categoria", "struttura", "ambito", "descrizione", "risposta"],
            vec!["wifi", "Villa Rosa", "rete", "password wifi", "La password è fiori123"],
            vec!["spa", "", "orari", "apertura spa", ""],
            vec!["", "", "", "", ""],
        ]);
        let map = resolve_headers(&s.rows[0]);
        let rows = parse_kb_rows(&s, &map);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].unit.as_deref(), Some("Villa Rosa"));
        assert_eq!(rows[0].answer, "La password è fiori123");
    }

    #[test]
    fn registry_indexes_by_name_and_id() {
        let s = sheet(vec![
            vec!["ID", "Nome struttura", "Indirizzo"],
            vec!["P1", "Villa Rosa", "Via Roma 1"],
            vec!["P2", "Casa Blu", "Via Milano 2"],
            vec!["", "", ""],
        ]);
        let registry = parse_registry(&s);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.display_name("P1"), "Villa Rosa");
        assert_eq!(registry.display_name("P9"), "P9");
        let record = registry.record("P2").unwrap();
        assert_eq!(record.get("Indirizzo").map(String::as_str), Some("Via Milano 2"));
        assert!(registry.record("Villa Rosa").is_some());
        assert!(registry.record("sconosciuta").is_none());
    }

    #[test]
    fn registry_without_name_column_keys_on_first() {
        let s = sheet(vec![
            vec!["Struttura", "Telefono"],
            vec!["Villa Rosa", "+39 055 000"],
        ]);
        let registry = parse_registry(&s);
        assert!(registry.record("Villa Rosa").is_some());
    }
}
