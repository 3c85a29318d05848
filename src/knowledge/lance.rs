//! LanceDB Vector Store - persistent hybrid store
//!
//! One table holds payload columns, a fixed-size dense vector column and the
//! sparse vector as two parallel list columns. Dense ranking runs inside
//! LanceDB with a pre-filter; sparse ranking loads the filtered rows' sparse
//! columns and scores them with corpus-state IDF.
//!
//! ref: https://lancedb.github.io/lancedb/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arrow_array::types::{Float32Type, UInt32Type};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, ListArray, RecordBatch,
    RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::DistanceType;
use tokio::sync::Mutex;

use crate::error::{RagError, RagResult};
use crate::knowledge::vector::{
    rank_sparse, sort_ranked, Chunk, ChunkRecord, CompanySummary, RankedCandidates, ScoredId,
    SparseVector, VectorStore,
};

const TABLE_NAME: &str = "chunks";

/// Payload columns read back for ranking
const PAYLOAD_COLUMNS: [&str; 8] = [
    "chunk_id",
    "document_id",
    "company",
    "url",
    "title",
    "text",
    "position",
    "offset",
];

/// Max ids per `IN (...)` predicate
const DELETE_BATCH: usize = 256;

// ============================================================================
// LanceVectorStore
// ============================================================================

pub struct LanceVectorStore {
    db: Connection,
    dimension: usize,
    /// Serializes table creation and writes
    write_lock: Mutex<()>,
}

impl LanceVectorStore {
    /// Open the `.lance` directory, creating parents as needed
    pub async fn open(path: &Path, dimension: usize) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| RagError::Configuration(format!("invalid path encoding: {:?}", path)))?;

        let db = lancedb::connect(path_str).execute().await?;

        Ok(Self {
            db,
            dimension,
            write_lock: Mutex::new(()),
        })
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("company", DataType::Utf8, false),
            Field::new("url", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("position", DataType::Int32, false),
            Field::new("offset", DataType::Int32, false),
            Field::new(
                "dense",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
            Field::new(
                "sparse_indices",
                DataType::List(Arc::new(Field::new("item", DataType::UInt32, true))),
                false,
            ),
            Field::new(
                "sparse_values",
                DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
                false,
            ),
        ]))
    }

    fn records_to_batch(&self, records: &[ChunkRecord]) -> RagResult<RecordBatch> {
        if let Some(bad) = records.iter().find(|r| r.dense.len() != self.dimension) {
            return Err(RagError::Configuration(format!(
                "chunk {} has dense dimension {}, store expects {}",
                bad.chunk.chunk_id,
                bad.dense.len(),
                self.dimension
            )));
        }

        let dense_flat: Vec<f32> = records.iter().flat_map(|r| r.dense.iter().copied()).collect();
        let dense = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(Float32Array::from(dense_flat)),
            None,
        )?;

        let sparse_indices = ListArray::from_iter_primitive::<UInt32Type, _, _>(
            records
                .iter()
                .map(|r| Some(r.sparse.indices.iter().map(|i| Some(*i)).collect::<Vec<_>>())),
        );
        let sparse_values = ListArray::from_iter_primitive::<Float32Type, _, _>(
            records
                .iter()
                .map(|r| Some(r.sparse.values.iter().map(|v| Some(*v)).collect::<Vec<_>>())),
        );

        let batch = RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(string_array(records, |c| c.chunk_id.as_str())),
                Arc::new(string_array(records, |c| c.document_id.as_str())),
                Arc::new(string_array(records, |c| c.company.as_str())),
                Arc::new(string_array(records, |c| c.url.as_str())),
                Arc::new(string_array(records, |c| c.title.as_str())),
                Arc::new(string_array(records, |c| c.text.as_str())),
                Arc::new(Int32Array::from(
                    records.iter().map(|r| r.chunk.position as i32).collect::<Vec<_>>(),
                )),
                Arc::new(Int32Array::from(
                    records.iter().map(|r| r.chunk.offset as i32).collect::<Vec<_>>(),
                )),
                Arc::new(dense),
                Arc::new(sparse_indices),
                Arc::new(sparse_values),
            ],
        )?;

        Ok(batch)
    }

    async fn table_exists(&self) -> RagResult<bool> {
        let names = self.db.table_names().execute().await?;
        Ok(names.iter().any(|n| n == TABLE_NAME))
    }

    /// Open the table, or `None` before the first upsert
    async fn table(&self) -> RagResult<Option<lancedb::table::Table>> {
        if !self.table_exists().await? {
            return Ok(None);
        }
        Ok(Some(self.db.open_table(TABLE_NAME).execute().await?))
    }

    /// Read a projection of the (optionally filtered) table
    async fn scan(
        &self,
        columns: &[&str],
        predicate: Option<String>,
    ) -> RagResult<Vec<RecordBatch>> {
        let Some(table) = self.table().await? else {
            return Ok(vec![]);
        };

        let mut query = table.query().select(Select::columns(columns));
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }

        let batches: Vec<RecordBatch> = query.execute().await?.try_collect().await?;
        Ok(batches)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, records: &[ChunkRecord]) -> RagResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let batch = self.records_to_batch(records)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let _guard = self.write_lock.lock().await;
        match self.table().await? {
            Some(table) => {
                let mut merge = table.merge_insert(&["chunk_id"]);
                merge.when_matched_update_all(None).when_not_matched_insert_all();
                merge.execute(Box::new(reader)).await?;
            }
            None => {
                self.db.create_table(TABLE_NAME, reader).execute().await?;
                tracing::info!("Created LanceDB table '{}' (dim={})", TABLE_NAME, self.dimension);
            }
        }

        tracing::debug!("Upserted {} records into LanceDB", records.len());
        Ok(records.len())
    }

    async fn query_dense(
        &self,
        dense: &[f32],
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates> {
        let Some(table) = self.table().await? else {
            return Ok(RankedCandidates::default());
        };

        let mut query = table
            .vector_search(dense.to_vec())?
            .column("dense")
            .distance_type(DistanceType::Cosine)
            .select(Select::columns(&PAYLOAD_COLUMNS))
            .limit(top_k);
        if let Some(company) = filter {
            query = query.only_if(company_predicate(company));
        }

        let batches: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

        let mut candidates = RankedCandidates::default();
        for batch in &batches {
            let chunks = read_chunks(batch)?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RagError::Storage("missing _distance column".into()))?;

            for (i, chunk) in chunks.into_iter().enumerate() {
                // cosine distance = 1 - similarity
                candidates.ranked.push(ScoredId {
                    chunk_id: chunk.chunk_id.clone(),
                    score: 1.0 - distances.value(i),
                });
                candidates.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
        }

        sort_ranked(&mut candidates.ranked);
        candidates.ranked.truncate(top_k);
        Ok(candidates)
    }

    async fn query_sparse(
        &self,
        sparse: &SparseVector,
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates> {
        if sparse.is_empty() {
            return Ok(RankedCandidates::default());
        }

        let mut columns: Vec<&str> = PAYLOAD_COLUMNS.to_vec();
        columns.extend(["sparse_indices", "sparse_values"]);
        let batches = self.scan(&columns, filter.map(company_predicate)).await?;

        let mut rows: Vec<(Chunk, SparseVector)> = Vec::new();
        for batch in &batches {
            let chunks = read_chunks(batch)?;
            let vectors = read_sparse(batch)?;
            rows.extend(chunks.into_iter().zip(vectors));
        }

        let ranked = rank_sparse(
            sparse,
            rows.iter().map(|(c, s)| (c.chunk_id.as_str(), s)),
            top_k,
        );

        let wanted: HashSet<&str> = ranked.iter().map(|s| s.chunk_id.as_str()).collect();
        let chunks: HashMap<String, Chunk> = rows
            .into_iter()
            .filter(|(c, _)| wanted.contains(c.chunk_id.as_str()))
            .map(|(c, _)| (c.chunk_id.clone(), c))
            .collect();

        Ok(RankedCandidates { chunks, ranked })
    }

    async fn delete_by_company(&self, company: &str) -> RagResult<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(table) = self.table().await? else {
            return Ok(0);
        };

        let predicate = company_predicate(company);
        let matching = table.count_rows(Some(predicate.clone())).await?;
        if matching > 0 {
            table.delete(&predicate).await?;
        }

        tracing::info!("Deleted {} LanceDB records for '{}'", matching, company);
        Ok(matching)
    }

    async fn retain_company_chunks(
        &self,
        company: &str,
        keep: &HashSet<String>,
    ) -> RagResult<usize> {
        let stale: Vec<String> = self
            .chunk_ids(company)
            .await?
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let Some(table) = self.table().await? else {
            return Ok(0);
        };

        for ids in stale.chunks(DELETE_BATCH) {
            let list = ids.iter().map(|id| sql_literal(id)).collect::<Vec<_>>().join(", ");
            let predicate = format!("{} AND chunk_id IN ({})", company_predicate(company), list);
            table.delete(&predicate).await?;
        }

        Ok(stale.len())
    }

    async fn list_companies(&self) -> RagResult<Vec<CompanySummary>> {
        let batches = self.scan(&["company"], None).await?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for batch in &batches {
            let companies = string_column(batch, "company")?;
            for i in 0..batch.num_rows() {
                *counts.entry(companies.value(i).to_string()).or_insert(0) += 1;
            }
        }

        Ok(counts
            .into_iter()
            .map(|(company, chunks)| CompanySummary { company, chunks })
            .collect())
    }

    async fn chunk_ids(&self, company: &str) -> RagResult<Vec<String>> {
        let batches = self
            .scan(&["chunk_id"], Some(company_predicate(company)))
            .await?;

        let mut ids = Vec::new();
        for batch in &batches {
            let column = string_column(batch, "chunk_id")?;
            ids.extend((0..batch.num_rows()).map(|i| column.value(i).to_string()));
        }
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> RagResult<usize> {
        match self.table().await? {
            Some(table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }

    async fn health(&self) -> RagResult<()> {
        self.db.table_names().execute().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lancedb"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Quote a string literal for a Lance SQL predicate
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn company_predicate(company: &str) -> String {
    format!("company = {}", sql_literal(company))
}

fn string_array<F>(records: &[ChunkRecord], field: F) -> StringArray
where
    F: for<'r> Fn(&'r Chunk) -> &'r str,
{
    StringArray::from(records.iter().map(|r| field(&r.chunk)).collect::<Vec<&str>>())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> RagResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| RagError::Storage(format!("missing {} column", name)))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> RagResult<&'a Int32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| RagError::Storage(format!("missing {} column", name)))
}

fn list_column<'a>(batch: &'a RecordBatch, name: &str) -> RagResult<&'a ListArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<ListArray>())
        .ok_or_else(|| RagError::Storage(format!("missing {} column", name)))
}

fn read_chunks(batch: &RecordBatch) -> RagResult<Vec<Chunk>> {
    let chunk_ids = string_column(batch, "chunk_id")?;
    let document_ids = string_column(batch, "document_id")?;
    let companies = string_column(batch, "company")?;
    let urls = string_column(batch, "url")?;
    let titles = string_column(batch, "title")?;
    let texts = string_column(batch, "text")?;
    let positions = int_column(batch, "position")?;
    let offsets = int_column(batch, "offset")?;

    Ok((0..batch.num_rows())
        .map(|i| Chunk {
            chunk_id: chunk_ids.value(i).to_string(),
            document_id: document_ids.value(i).to_string(),
            company: companies.value(i).to_string(),
            url: urls.value(i).to_string(),
            title: titles.value(i).to_string(),
            text: texts.value(i).to_string(),
            position: positions.value(i) as u32,
            offset: offsets.value(i) as u32,
        })
        .collect())
}

fn read_sparse(batch: &RecordBatch) -> RagResult<Vec<SparseVector>> {
    let indices = list_column(batch, "sparse_indices")?;
    let values = list_column(batch, "sparse_values")?;

    (0..batch.num_rows())
        .map(|i| {
            let idx = indices.value(i);
            let idx = idx
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| RagError::Storage("sparse_indices is not UInt32".into()))?;
            let val = values.value(i);
            let val = val
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| RagError::Storage("sparse_values is not Float32".into()))?;

            Ok(SparseVector {
                indices: idx.values().to_vec(),
                values: val.values().to_vec(),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
