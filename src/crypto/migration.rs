//! Background migration: seal plaintext values left in encrypted columns.
//!
//! Walks a column in id order, skips values that already open under the
//! current keyset, and rewrites the rest. Progress is logged every
//! `progress_every` rows so a long run can be followed and resumed.

use async_trait::async_trait;

use super::Envelope;

pub struct ColumnRow {
    pub id: String,
    pub value: String,
}

/// A column that should hold envelope ciphertext.
#[async_trait]
pub trait ColumnSource: Send + Sync {
    fn name(&self) -> String;

    /// Rows with id strictly greater than `after`, in ascending id order.
    async fn fetch_batch(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<ColumnRow>>;

    async fn write(&self, id: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub progress_every: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            progress_every: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub scanned: usize,
    pub encrypted: usize,
    pub skipped: usize,
}

pub async fn encrypt_column(
    source: &dyn ColumnSource,
    envelope: &Envelope,
    opts: MigrationOptions,
) -> anyhow::Result<MigrationReport> {
    let name = source.name();
    let batch_size = opts.batch_size.max(1);
    let progress_every = opts.progress_every.max(1);
    let mut report = MigrationReport::default();
    let mut cursor: Option<String> = None;

    tracing::info!(column = %name, "starting column encryption migration");

    loop {
        let batch = source.fetch_batch(cursor.as_deref(), batch_size).await?;
        if batch.is_empty() {
            break;
        }

        for row in &batch {
            report.scanned += 1;
            if envelope.is_encrypted(&row.value) {
                report.skipped += 1;
            } else {
                let sealed = envelope.encrypt_str(&row.value)?;
                source.write(&row.id, &sealed).await?;
                report.encrypted += 1;
            }

            if report.scanned % progress_every == 0 {
                tracing::info!(
                    column = %name,
                    scanned = report.scanned,
                    encrypted = report.encrypted,
                    last_id = %row.id,
                    "column migration progress"
                );
            }
        }

        cursor = batch.last().map(|r| r.id.clone());
        if batch.len() < batch_size {
            break;
        }
    }

    tracing::info!(
        column = %name,
        scanned = report.scanned,
        encrypted = report.encrypted,
        skipped = report.skipped,
        "column encryption migration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keyset;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeColumn {
        rows: Mutex<BTreeMap<String, String>>,
    }

    #[async_trait]
    impl ColumnSource for FakeColumn {
        fn name(&self) -> String {
            "fake.secret".into()
        }

        async fn fetch_batch(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<ColumnRow>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|(id, _)| after.map(|a| id.as_str() > a).unwrap_or(true))
                .take(limit)
                .map(|(id, value)| ColumnRow {
                    id: id.clone(),
                    value: value.clone(),
                })
                .collect())
        }

        async fn write(&self, id: &str, value: &str) -> anyhow::Result<()> {
            self.rows.lock().unwrap().insert(id.to_string(), value.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn seals_plaintext_and_skips_ciphertext() {
        let envelope = Envelope::new(Keyset::generate());
        let already = envelope.encrypt_str("sealed-before").unwrap();

        let mut rows = BTreeMap::new();
        for i in 0..7 {
            rows.insert(format!("id-{:02}", i), format!("plain-{}", i));
        }
        rows.insert("id-99".into(), already.clone());
        let column = FakeColumn {
            rows: Mutex::new(rows),
        };

        let report = encrypt_column(
            &column,
            &envelope,
            MigrationOptions {
                batch_size: 3,
                progress_every: 2,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            MigrationReport {
                scanned: 8,
                encrypted: 7,
                skipped: 1
            }
        );

        let rows = column.rows.lock().unwrap();
        assert_eq!(rows["id-99"], already, "ciphertext must be left untouched");
        assert_eq!(envelope.decrypt_str(&rows["id-03"]).unwrap(), "plain-3");
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let envelope = Envelope::new(Keyset::generate());
        let column = FakeColumn {
            rows: Mutex::new(BTreeMap::from([("a".to_string(), "x".to_string())])),
        };
        encrypt_column(&column, &envelope, MigrationOptions::default()).await.unwrap();
        let report = encrypt_column(&column, &envelope, MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(report.encrypted, 0);
        assert_eq!(report.skipped, 1);
    }
}
