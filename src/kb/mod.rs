//! KB 存储：属性过滤 + 余弦检索 + 以源为准的同步
//!
//! 检索每次全量扫描（KB 足够小），属性过滤在嵌入之前；
//! 同步把源当作唯一事实：按行哈希差异做删除 / 插入，未变更行不重嵌入，
//! 差异在一个事务里提交。结构登记整体重建后原子换入，
//! 读取方不会看到半更新状态。

pub mod sheet;
pub mod source;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ConciergeError;
use crate::llm::EmbeddingClient;
use crate::store::{NewKbEntry, Store};

pub use sheet::{KbRow, PropertyRegistry};
pub use source::{JsonWorkbookSource, KbSource, StaticWorkbookSource, Workbook};

/// 检索结果：一次调用内的瞬态值，不落库
#[derive(Debug, Clone)]
pub struct RetrievedKb {
    pub score: f32,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub answer: String,
}

/// 一次同步的结果
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    /// 源不可用或没有有效行，本次同步未触碰存储
    pub skipped: bool,
    pub inserted: usize,
    pub deleted: usize,
    pub total: usize,
}

/// 源文件体检结果（管理端点用）
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sheet_names: Vec<String>,
    pub headers: Vec<String>,
    pub header_map: HashMap<String, String>,
    pub header_fallback: bool,
    pub row_count_valid: usize,
    pub row_count_total: usize,
    pub sample_rows: Vec<KbRow>,
}

impl InspectReport {
    fn failed(error: &str) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            sheet_names: Vec::new(),
            headers: Vec::new(),
            header_map: HashMap::new(),
            header_fallback: false,
            row_count_valid: 0,
            row_count_total: 0,
            sample_rows: Vec::new(),
        }
    }
}

/// 通配 unit 标记（大小写不敏感）：条目对所有属性生效
const WILDCARD_UNITS: [&str; 6] = ["*", "all", "tutte", "tutti", "generale", "general"];

/// 属性范围匹配
///
/// 无 unit 或通配 unit 的条目对任何属性（含无提示）生效；
/// 其余条目仅在 unit 与提示去空白、不分大小写相等时生效。
/// 没有属性提示时专属条目一律不匹配：未解析出属性的查询看不到专属行。
pub fn matches_property(unit: Option<&str>, property_hint: Option<&str>) -> bool {
    let Some(unit) = unit.map(str::trim).filter(|u| !u.is_empty()) else {
        return true;
    };
    let unit_norm = unit.to_lowercase();
    if WILDCARD_UNITS.contains(&unit_norm.as_str()) {
        return true;
    }
    let Some(hint) = property_hint else {
        return false;
    };
    unit_norm == hint.trim().to_lowercase()
}

/// 余弦相似度；任一向量为空、长度不一致或零范数时定义为 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 行内容哈希：规范字段映射的排序键 JSON 的 SHA-256，字段顺序无关
pub fn row_hash(row: &KbRow) -> String {
    let map: BTreeMap<&str, Option<&str>> =
        sheet::FIELDS.iter().map(|f| (*f, row.field(f))).collect();
    let blob = serde_json::to_string(&map).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 嵌入文本：按规范字段顺序拼 "field: value" 行，空字段跳过
pub fn embedding_text(row: &KbRow) -> String {
    sheet::FIELDS
        .iter()
        .filter_map(|f| row.field(f).map(|v| format!("{}: {}", f, v)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct KbStore {
    store: Store,
    embedder: Arc<dyn EmbeddingClient>,
    registry: RwLock<Arc<PropertyRegistry>>,
    top_k: usize,
    min_score: f32,
}

impl KbStore {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingClient>, top_k: usize, min_score: f32) -> Self {
        Self {
            store,
            embedder,
            registry: RwLock::new(Arc::new(PropertyRegistry::default())),
            top_k,
            min_score,
        }
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    /// 当前结构登记快照
    pub fn registry(&self) -> Arc<PropertyRegistry> {
        self.registry.read().unwrap().clone()
    }

    /// 按属性范围 + 余弦分数检索 top_k 条
    pub async fn retrieve(
        &self,
        query: &str,
        property_hint: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedKb>, ConciergeError> {
        let top_k = top_k.unwrap_or(self.top_k);

        let entries = self.store.kb_entries().await?;
        let candidates: Vec<_> = entries
            .into_iter()
            .filter(|e| matches_property(e.unit.as_deref(), property_hint))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut scored: Vec<RetrievedKb> = candidates
            .into_iter()
            .map(|e| RetrievedKb {
                score: cosine_similarity(&query_vec, &e.embedding),
                category: e.category,
                unit: e.unit,
                scope: e.scope,
                description: e.description,
                answer: e.answer,
            })
            .collect();

        // 稳定排序：同分按插入顺序
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// 从源同步：表一 KB 行差异同步，表二（若有）重建结构登记并原子换入
    pub async fn sync(&self, source: &dyn KbSource) -> Result<SyncReport, ConciergeError> {
        let Some(workbook) = source.load()? else {
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };
        let Some(kb_sheet) = workbook.sheets.first() else {
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };

        let headers = kb_sheet.rows.first().cloned().unwrap_or_default();
        let map = sheet::resolve_headers(&headers);
        let rows = sheet::parse_kb_rows(kb_sheet, &map);

        if let Some(registry_sheet) = workbook.sheets.get(1) {
            let registry = sheet::parse_registry(registry_sheet);
            *self.registry.write().unwrap() = Arc::new(registry);
        }

        // 没有任何有效行按坏文件处理，保留既有条目
        if rows.is_empty() {
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        self.sync_rows(&rows).await
    }

    /// 源为准的差异同步：删掉源里不存在的哈希，嵌入并插入新哈希。
    /// 嵌入在事务之外计算，删除与插入在同一事务里落库，
    /// 同步期间的读者看不到半更新的条目集合。
    async fn sync_rows(&self, rows: &[KbRow]) -> Result<SyncReport, ConciergeError> {
        let desired: Vec<(String, &KbRow)> = rows.iter().map(|r| (row_hash(r), r)).collect();
        let desired_hashes: HashSet<&str> = desired.iter().map(|(h, _)| h.as_str()).collect();
        let existing = self.store.kb_hashes().await?;

        let stale: Vec<String> = existing
            .iter()
            .filter(|h| !desired_hashes.contains(h.as_str()))
            .cloned()
            .collect();

        let mut seen = HashSet::new();
        let missing: Vec<&(String, &KbRow)> = desired
            .iter()
            .filter(|(h, _)| !existing.contains(h) && seen.insert(h.clone()))
            .collect();

        let mut new_entries = Vec::with_capacity(missing.len());
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(_, r)| embedding_text(r)).collect();
            let embeddings = self.embedder.embed(&texts).await?;

            for ((hash, row), embedding) in missing.into_iter().zip(embeddings) {
                new_entries.push(NewKbEntry {
                    row_hash: hash.clone(),
                    category: row.category.clone(),
                    unit: row.unit.clone(),
                    scope: row.scope.clone(),
                    description: row.description.clone(),
                    answer: row.answer.clone(),
                    embedding,
                });
            }
        }

        let inserted = new_entries.len();
        let deleted = stale.len();
        if inserted > 0 || deleted > 0 {
            self.store.apply_kb_diff(&stale, &new_entries).await?;
        }

        Ok(SyncReport {
            skipped: false,
            inserted,
            deleted,
            total: desired_hashes.len(),
        })
    }

    /// 体检源文件：表名、表头映射、有效行数与样例（不触碰存储）
    pub fn inspect(&self, source: &dyn KbSource) -> InspectReport {
        let workbook = match source.load() {
            Ok(Some(wb)) => wb,
            Ok(None) => return InspectReport::failed("File not found"),
            Err(e) => return InspectReport::failed(&e.to_string()),
        };
        let Some(kb_sheet) = workbook.sheets.first() else {
            return InspectReport::failed("No sheets found");
        };

        let headers = kb_sheet.rows.first().cloned().unwrap_or_default();
        let map = sheet::resolve_headers(&headers);
        let rows = sheet::parse_kb_rows(kb_sheet, &map);

        InspectReport {
            ok: true,
            error: None,
            sheet_names: workbook.sheets.iter().map(|s| s.name.clone()).collect(),
            headers,
            header_map: map.resolved.clone(),
            header_fallback: map.fallback,
            row_count_valid: rows.len(),
            row_count_total: kb_sheet.rows.len().saturating_sub(1),
            sample_rows: rows.into_iter().take(3).collect(),
        }
    }
}
