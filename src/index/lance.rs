use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatchIterator;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::{
    connect,
    query::{ExecutableQuery, QueryBase},
    Connection, DistanceType,
};

use crate::error::{Error, Result};
use crate::index::{IndexEntry, IndexStats, ScoredEntry, VectorBackend};
use crate::types::Modality;

/// Persistent backend over LanceDB, one table per modality so each table
/// carries exactly one fixed embedding dimension.
pub struct LanceBackend {
    db: Connection,
    tables: HashMap<Modality, (String, usize)>,
}

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(e.to_string())
}

fn quote_filter_string(input: &str) -> String {
    input.replace('\'', "''")
}

fn table_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("seq", DataType::Int64, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dim as i32,
            ),
            false,
        ),
    ]))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::StoreUnavailable(format!("missing column: {}", name)))
}

impl LanceBackend {
    /// Open (or create) the index at `path`. An `image_dim` of zero means a
    /// text-only deployment and no image table is created.
    pub async fn open(path: &Path, text_dim: usize, image_dim: usize) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(store_err)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Config(format!("non-utf8 store path: {}", path.display())))?;

        let db = connect(path_str).execute().await.map_err(store_err)?;

        let mut tables = HashMap::new();
        tables.insert(Modality::Text, ("chunks_text".to_string(), text_dim));
        if image_dim > 0 {
            tables.insert(Modality::Image, ("chunks_image".to_string(), image_dim));
        }

        let backend = Self { db, tables };
        backend.initialize_tables().await?;
        Ok(backend)
    }

    async fn initialize_tables(&self) -> Result<()> {
        let existing = self.db.table_names().execute().await.map_err(store_err)?;

        for (name, dim) in self.tables.values() {
            if existing.contains(name) {
                continue;
            }
            let schema = table_schema(*dim);
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let batch_reader = RecordBatchIterator::new(std::iter::once(Ok(empty_batch)), schema);
            self.db
                .create_table(name, batch_reader)
                .execute()
                .await
                .map_err(store_err)?;
        }

        Ok(())
    }

    fn table_for(&self, modality: Modality) -> Result<(&str, usize)> {
        self.tables
            .get(&modality)
            .map(|(name, dim)| (name.as_str(), *dim))
            .ok_or_else(|| {
                Error::UnsupportedModality(format!("no {} table in this index", modality))
            })
    }

    fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<IndexEntry>> {
        let chunk_ids = column::<StringArray>(batch, "chunk_id")?;
        let document_ids = column::<StringArray>(batch, "document_id")?;
        let contents = column::<StringArray>(batch, "content")?;
        let titles = column::<StringArray>(batch, "title")?;
        let sources = column::<StringArray>(batch, "source")?;
        let categories = column::<StringArray>(batch, "category")?;
        let hashes = column::<StringArray>(batch, "content_hash")?;
        let metadatas = column::<StringArray>(batch, "metadata")?;
        let seqs = column::<Int64Array>(batch, "seq")?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let metadata: BTreeMap<String, String> =
                serde_json::from_str(metadatas.value(i)).unwrap_or_default();

            rows.push(IndexEntry {
                chunk_id: chunk_ids.value(i).to_string(),
                document_id: document_ids.value(i).to_string(),
                text: contents.value(i).to_string(),
                title: titles.value(i).to_string(),
                source: sources.value(i).to_string(),
                category: categories.value(i).to_string(),
                content_hash: hashes.value(i).to_string(),
                metadata,
                // Scans never re-read stored vectors.
                embedding: Vec::new(),
                seq: seqs.value(i) as u64,
            });
        }

        Ok(rows)
    }

    fn entries_from_batch(batch: &RecordBatch) -> Result<Vec<ScoredEntry>> {
        let distances = column::<Float32Array>(batch, "_distance")?;
        let rows = Self::rows_from_batch(batch)?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, entry)| ScoredEntry {
                entry,
                distance: distances.value(i),
            })
            .collect())
    }
}

#[async_trait]
impl VectorBackend for LanceBackend {
    async fn add_batch(&self, modality: Modality, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let (table_name, dim) = self.table_for(modality)?;

        let chunk_ids: Vec<&str> = entries.iter().map(|e| e.chunk_id.as_str()).collect();
        let document_ids: Vec<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();
        let contents: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
        let sources: Vec<&str> = entries.iter().map(|e| e.source.as_str()).collect();
        let categories: Vec<&str> = entries.iter().map(|e| e.category.as_str()).collect();
        let hashes: Vec<&str> = entries.iter().map(|e| e.content_hash.as_str()).collect();
        let seqs: Vec<i64> = entries.iter().map(|e| e.seq as i64).collect();

        let mut metadatas = Vec::with_capacity(entries.len());
        for entry in &entries {
            metadatas.push(serde_json::to_string(&entry.metadata).map_err(store_err)?);
        }

        let embedding_values: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();
        let embedding_array = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            dim as i32,
            Arc::new(Float32Array::from(embedding_values)),
            None,
        )
        .map_err(store_err)?;

        let schema = table_schema(dim);
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(document_ids)),
                Arc::new(StringArray::from(contents)),
                Arc::new(StringArray::from(titles)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(categories)),
                Arc::new(StringArray::from(hashes)),
                Arc::new(StringArray::from(metadatas)),
                Arc::new(Int64Array::from(seqs)),
                Arc::new(embedding_array),
            ],
        )
        .map_err(store_err)?;

        let table = self
            .db
            .open_table(table_name)
            .execute()
            .await
            .map_err(store_err)?;

        let batch_reader =
            RecordBatchIterator::new(std::iter::once(Ok(batch.clone())), batch.schema());
        table.add(batch_reader).execute().await.map_err(store_err)?;

        Ok(())
    }

    async fn search(
        &self,
        modality: Modality,
        query: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ScoredEntry>> {
        let (table_name, _) = self.table_for(modality)?;
        let table = self
            .db
            .open_table(table_name)
            .execute()
            .await
            .map_err(store_err)?;

        let mut search = table
            .vector_search(query)
            .map_err(store_err)?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(category) = category {
            search = search.only_if(format!("category = '{}'", quote_filter_string(category)));
        }

        let mut results = search.execute().await.map_err(store_err)?;
        let mut entries = Vec::new();
        while let Some(batch) = results.try_next().await.map_err(store_err)? {
            if batch.num_rows() == 0 {
                continue;
            }
            entries.extend(Self::entries_from_batch(&batch)?);
        }

        Ok(entries)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let filter = format!("document_id = '{}'", quote_filter_string(document_id));
        let mut removed = 0;

        for (table_name, _) in self.tables.values() {
            let table = self
                .db
                .open_table(table_name)
                .execute()
                .await
                .map_err(store_err)?;
            removed += table
                .count_rows(Some(filter.clone()))
                .await
                .map_err(store_err)?;
            table.delete(&filter).await.map_err(store_err)?;
        }

        Ok(removed)
    }

    async fn contains_hash(&self, content_hash: &str) -> Result<bool> {
        let filter = format!("content_hash = '{}'", quote_filter_string(content_hash));

        for (table_name, _) in self.tables.values() {
            let table = self
                .db
                .open_table(table_name)
                .execute()
                .await
                .map_err(store_err)?;
            let count = table
                .count_rows(Some(filter.clone()))
                .await
                .map_err(store_err)?;
            if count > 0 {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn scan(&self, modality: Modality) -> Result<Vec<IndexEntry>> {
        let (table_name, _) = self.table_for(modality)?;
        let table = self
            .db
            .open_table(table_name)
            .execute()
            .await
            .map_err(store_err)?;

        let results = table.query().execute().await.map_err(store_err)?;
        let batches: Vec<RecordBatch> = results.try_collect().await.map_err(store_err)?;

        let mut entries = Vec::new();
        for batch in &batches {
            entries.extend(Self::rows_from_batch(batch)?);
        }
        Ok(entries)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let mut chunk_count = 0;
        let mut documents = std::collections::HashSet::new();

        for (table_name, _) in self.tables.values() {
            let table = self
                .db
                .open_table(table_name)
                .execute()
                .await
                .map_err(store_err)?;
            chunk_count += table.count_rows(None).await.map_err(store_err)?;

            let results = table.query().execute().await.map_err(store_err)?;
            let batches: Vec<RecordBatch> = results.try_collect().await.map_err(store_err)?;
            for batch in &batches {
                let document_ids = column::<StringArray>(batch, "document_id")?;
                for i in 0..batch.num_rows() {
                    documents.insert(document_ids.value(i).to_string());
                }
            }
        }

        Ok(IndexStats {
            document_count: documents.len(),
            chunk_count,
        })
    }

    async fn max_seq(&self) -> Result<u64> {
        let mut max_seq = 0u64;

        for (table_name, _) in self.tables.values() {
            let table = self
                .db
                .open_table(table_name)
                .execute()
                .await
                .map_err(store_err)?;
            let results = table.query().execute().await.map_err(store_err)?;
            let batches: Vec<RecordBatch> = results.try_collect().await.map_err(store_err)?;
            for batch in &batches {
                let seqs = column::<Int64Array>(batch, "seq")?;
                for i in 0..batch.num_rows() {
                    max_seq = max_seq.max(seqs.value(i) as u64);
                }
            }
        }

        Ok(max_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn entry(chunk_id: &str, document_id: &str, seq: u64, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            text: format!("text of {}", chunk_id),
            title: "Title".to_string(),
            source: "unit".to_string(),
            category: "general".to_string(),
            content_hash: format!("hash-{}", document_id),
            metadata: BTreeMap::new(),
            embedding,
            seq,
        }
    }

    #[tokio::test]
    async fn test_store_search_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LanceBackend::open(dir.path(), 3, 0).await.unwrap();

        backend
            .add_batch(
                Modality::Text,
                vec![
                    entry("a", "d1", 1, vec![1.0, 0.0, 0.0]),
                    entry("b", "d2", 2, vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let results = backend
            .search(Modality::Text, &[1.0, 0.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let exact = results
            .iter()
            .find(|r| r.entry.document_id == "d1")
            .unwrap();
        let orthogonal = results
            .iter()
            .find(|r| r.entry.document_id == "d2")
            .unwrap();
        assert!(exact.distance < orthogonal.distance);
        assert_eq!(exact.entry.text, "text of a");

        assert!(backend.contains_hash("hash-d1").await.unwrap());
        assert!(!backend.contains_hash("missing").await.unwrap());
        assert_eq!(backend.max_seq().await.unwrap(), 2);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.chunk_count, 2);

        let removed = backend.delete_document("d1").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.stats().await.unwrap().chunk_count, 1);
    }

    #[tokio::test]
    async fn test_category_filter_quotes_input() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LanceBackend::open(dir.path(), 3, 0).await.unwrap();

        let mut quoted = entry("a", "d1", 1, vec![1.0, 0.0, 0.0]);
        quoted.category = "o'neill".to_string();
        backend
            .add_batch(Modality::Text, vec![quoted])
            .await
            .unwrap();

        let results = backend
            .search(Modality::Text, &[1.0, 0.0, 0.0], 5, Some("o'neill"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let results = backend
            .search(Modality::Text, &[1.0, 0.0, 0.0], 5, Some("other"))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_text_only_index_rejects_image_modality() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LanceBackend::open(dir.path(), 3, 0).await.unwrap();

        let err = backend
            .search(Modality::Image, &[0.0, 0.0], 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedModality(_)));
    }

    #[tokio::test]
    async fn test_reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = LanceBackend::open(dir.path(), 3, 0).await.unwrap();
            backend
                .add_batch(Modality::Text, vec![entry("a", "d1", 7, vec![1.0, 0.0, 0.0])])
                .await
                .unwrap();
        }

        let backend = LanceBackend::open(dir.path(), 3, 0).await.unwrap();
        assert_eq!(backend.stats().await.unwrap().chunk_count, 1);
        assert_eq!(backend.max_seq().await.unwrap(), 7);
    }
}
