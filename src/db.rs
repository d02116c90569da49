use crate::db_types::{
    round1, AddContact, CallRecord, Campaign, CampaignStats, CampaignStatus, Contact,
    ContactStatus, DeadLetter, ImportSummary, NewCall, NewContact, OverallStats,
};
use crate::error::AppError;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS campaigns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        campaign_id INTEGER REFERENCES campaigns(id),
        name TEXT NOT NULL,
        phone TEXT NOT NULL UNIQUE,
        company TEXT,
        email TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        contact_id INTEGER REFERENCES contacts(id),
        call_sid TEXT NOT NULL UNIQUE,
        phone TEXT NOT NULL,
        duration_seconds INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        outcome TEXT NOT NULL DEFAULT 'unknown',
        sales_score INTEGER NOT NULL DEFAULT 0,
        ai_summary TEXT,
        key_points TEXT,
        next_action TEXT,
        transcript TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_sid TEXT NOT NULL,
        reason TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_contacts_campaign ON contacts(campaign_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_contact ON calls(contact_id)",
];

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Deserialize)]
struct CsvContact {
    name: String,
    phone: String,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Campaigns, contacts, call records and analysis dead letters in SQLite.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Opens (creating if needed) the database at `database_url`, which is
    /// either a `sqlite:` url or a plain file path.
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let options = if database_url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(database_url)?
        } else {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            SqliteConnectOptions::new().filename(database_url)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.create_if_missing(true))
            .await?;
        info!(url=%database_url, "opened database");
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        // one connection, never recycled, or the in-memory database disappears
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Self { pool };
        db.migrate().await.unwrap();
        db
    }

    async fn migrate(&self) -> Result<(), AppError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("database schema ready");
        Ok(())
    }

    pub async fn create_campaign(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64, AppError> {
        let id = sqlx::query("INSERT INTO campaigns (name, description, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(description)
            .bind(now())
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        info!(campaign_id = id, name, "created campaign");
        Ok(id)
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>, AppError> {
        Ok(sqlx::query_as::<_, Campaign>(
            "SELECT id, name, description, status, created_at FROM campaigns ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get_campaign(&self, id: i64) -> Result<Option<Campaign>, AppError> {
        Ok(sqlx::query_as::<_, Campaign>(
            "SELECT id, name, description, status, created_at FROM campaigns WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_campaign_status(&self, id: i64, status: CampaignStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE campaigns SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks the campaign completed once none of its contacts are waiting to
    /// be called or mid-call.
    pub async fn refresh_campaign_status(&self, id: i64) -> Result<CampaignStatus, AppError> {
        let (open, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(CASE WHEN status IN ('pending', 'calling') THEN 1 END), COUNT(*)
             FROM contacts WHERE campaign_id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        let current = self
            .get_campaign(id)
            .await?
            .and_then(|c| CampaignStatus::from_str(&c.status).ok())
            .unwrap_or(CampaignStatus::Active);
        if total > 0 && open == 0 && current != CampaignStatus::Completed {
            self.set_campaign_status(id, CampaignStatus::Completed).await?;
            info!(campaign_id = id, "campaign completed");
            return Ok(CampaignStatus::Completed);
        }
        Ok(current)
    }

    pub async fn add_contact(&self, contact: &NewContact) -> Result<AddContact, AppError> {
        let result = sqlx::query(
            "INSERT INTO contacts (campaign_id, name, phone, company, email, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(phone) DO NOTHING",
        )
        .bind(contact.campaign_id)
        .bind(&contact.name)
        .bind(contact.phone.trim())
        .bind(&contact.company)
        .bind(&contact.email)
        .bind(now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            debug!(phone=%contact.phone, "contact already exists");
            return Ok(AddContact::AlreadyExists);
        }
        Ok(AddContact::Added(result.last_insert_rowid()))
    }

    /// Imports `name,phone,company,email` rows. Duplicates and unreadable rows
    /// are counted as skipped.
    pub async fn import_contacts_csv(
        &self,
        campaign_id: Option<i64>,
        path: &Path,
    ) -> Result<ImportSummary, AppError> {
        let bytes = tokio::fs::read(path).await?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(bytes.as_slice());
        let mut summary = ImportSummary::default();
        for (line, row) in reader.deserialize::<CsvContact>().enumerate() {
            let row = match row {
                Ok(row) if !row.phone.is_empty() => row,
                Ok(_) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error=%e, line = line + 2, "skipping unreadable csv row");
                    summary.skipped += 1;
                    continue;
                }
            };
            let contact = NewContact {
                campaign_id,
                name: row.name,
                phone: row.phone,
                company: row.company.filter(|c| !c.is_empty()),
                email: row.email.filter(|e| !e.is_empty()),
            };
            match self.add_contact(&contact).await? {
                AddContact::Added(_) => summary.imported += 1,
                AddContact::AlreadyExists => summary.skipped += 1,
            }
        }
        info!(imported = summary.imported, skipped = summary.skipped, "imported contacts");
        Ok(summary)
    }

    pub async fn list_contacts(
        &self,
        campaign_id: Option<i64>,
        status: Option<ContactStatus>,
    ) -> Result<Vec<Contact>, AppError> {
        let status = status.map(ContactStatus::as_str);
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT id, campaign_id, name, phone, company, email, status, created_at FROM contacts
             WHERE (? IS NULL OR campaign_id = ?) AND (? IS NULL OR status = ?)
             ORDER BY id",
        )
        .bind(campaign_id)
        .bind(campaign_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get_contact(&self, id: i64) -> Result<Option<Contact>, AppError> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT id, campaign_id, name, phone, company, email, status, created_at FROM contacts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn update_contact_status(&self, id: i64, status: ContactStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE contacts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(contact_id = id, status = status.as_str(), "contact status updated");
        Ok(())
    }

    /// Inserts the call, or updates the existing row with the same
    /// `call_sid`. Returns the row id, which is stable across updates.
    pub async fn upsert_call(&self, call: &NewCall) -> Result<i64, AppError> {
        let key_points = serde_json::to_string(&call.key_points)
            .map_err(|e| AppError::BadRequest(format!("unserializable key points: {e}")))?;
        let ts = now();
        sqlx::query(
            "INSERT INTO calls (contact_id, call_sid, phone, duration_seconds, status, outcome,
                                sales_score, ai_summary, key_points, next_action, transcript,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(call_sid) DO UPDATE SET
                contact_id = COALESCE(excluded.contact_id, calls.contact_id),
                phone = excluded.phone,
                duration_seconds = excluded.duration_seconds,
                status = excluded.status,
                outcome = excluded.outcome,
                sales_score = excluded.sales_score,
                ai_summary = excluded.ai_summary,
                key_points = excluded.key_points,
                next_action = excluded.next_action,
                transcript = excluded.transcript,
                updated_at = excluded.updated_at",
        )
        .bind(call.contact_id)
        .bind(&call.call_sid)
        .bind(&call.phone)
        .bind(i64::from(call.duration_seconds))
        .bind(&call.status)
        .bind(&call.outcome)
        .bind(i64::from(call.sales_score))
        .bind(&call.ai_summary)
        .bind(key_points)
        .bind(&call.next_action)
        .bind(&call.transcript)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM calls WHERE call_sid = ?")
            .bind(&call.call_sid)
            .fetch_one(&self.pool)
            .await?;
        debug!(call_sid=%call.call_sid, id, outcome=%call.outcome, "call record saved");
        Ok(id)
    }

    pub async fn get_call_by_sid(&self, call_sid: &str) -> Result<Option<CallRecord>, AppError> {
        Ok(sqlx::query_as::<_, CallRecord>("SELECT * FROM calls WHERE call_sid = ?")
            .bind(call_sid)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_calls(&self, campaign_id: Option<i64>) -> Result<Vec<CallRecord>, AppError> {
        Ok(sqlx::query_as::<_, CallRecord>(
            "SELECT c.* FROM calls c LEFT JOIN contacts co ON c.contact_id = co.id
             WHERE (? IS NULL OR co.campaign_id = ?)
             ORDER BY c.created_at DESC, c.id DESC",
        )
        .bind(campaign_id)
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats, AppError> {
        let (total_contacts, called, success, failed): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN status != 'pending' THEN 1 END),
                    COUNT(CASE WHEN status = 'success' THEN 1 END),
                    COUNT(CASE WHEN status = 'failed' THEN 1 END)
             FROM contacts WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        let (total_calls, avg_score, avg_duration): (i64, Option<f64>, Option<f64>) =
            sqlx::query_as(
                "SELECT COUNT(*), AVG(c.sales_score), AVG(c.duration_seconds)
                 FROM calls c JOIN contacts co ON c.contact_id = co.id
                 WHERE co.campaign_id = ?",
            )
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
        let success_rate = if called > 0 {
            success as f64 / called as f64 * 100.0
        } else {
            0.0
        };
        Ok(CampaignStats {
            total_contacts,
            total_calls,
            called,
            pending: total_contacts - called,
            success,
            failed,
            success_rate: round1(success_rate),
            avg_score: round1(avg_score.unwrap_or_default()),
            avg_duration: avg_duration.unwrap_or_default().round(),
        })
    }

    pub async fn overall_stats(&self) -> Result<OverallStats, AppError> {
        let (campaigns,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM campaigns")
            .fetch_one(&self.pool)
            .await?;
        let (contacts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contacts")
            .fetch_one(&self.pool)
            .await?;
        let (total_calls, meetings, avg_score, avg_duration): (i64, i64, Option<f64>, Option<f64>) =
            sqlx::query_as(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN outcome = 'meeting_scheduled' THEN 1 END),
                        AVG(sales_score),
                        AVG(duration_seconds)
                 FROM calls",
            )
            .fetch_one(&self.pool)
            .await?;
        let success_rate = if total_calls > 0 {
            meetings as f64 / total_calls as f64 * 100.0
        } else {
            0.0
        };
        Ok(OverallStats {
            campaigns,
            contacts,
            total_calls,
            meetings,
            success_rate: round1(success_rate),
            avg_score: round1(avg_score.unwrap_or_default()),
            avg_duration: avg_duration.unwrap_or_default().round(),
        })
    }

    pub async fn insert_dead_letter(
        &self,
        call_sid: &str,
        reason: &str,
        payload: &str,
    ) -> Result<i64, AppError> {
        let id = sqlx::query(
            "INSERT INTO analysis_dead_letters (call_sid, reason, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(call_sid)
        .bind(reason)
        .bind(payload)
        .bind(now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        warn!(call_sid, reason, "analysis dead-lettered");
        Ok(id)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, AppError> {
        Ok(sqlx::query_as::<_, DeadLetter>(
            "SELECT id, call_sid, reason, payload, created_at FROM analysis_dead_letters ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn seeded_contact(db: &Db, name: &str, phone: &str) -> (i64, i64) {
        let campaign_id = db.create_campaign("Jaro", None).await.unwrap();
        let contact = NewContact {
            campaign_id: Some(campaign_id),
            name: name.to_string(),
            phone: phone.to_string(),
            ..Default::default()
        };
        match db.add_contact(&contact).await.unwrap() {
            AddContact::Added(id) => (campaign_id, id),
            AddContact::AlreadyExists => panic!("fresh database already had {phone}"),
        }
    }

    pub fn new_call(call_sid: &str, contact_id: Option<i64>) -> NewCall {
        NewCall {
            contact_id,
            call_sid: call_sid.to_string(),
            phone: "+420111222333".to_string(),
            duration_seconds: 42,
            status: "completed".to_string(),
            outcome: "unknown".to_string(),
            sales_score: 0,
            ai_summary: None,
            key_points: vec![],
            next_action: None,
            transcript: "[]".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{new_call, seeded_contact};
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn duplicate_phone_is_soft_failure() {
        let db = Db::in_memory().await;
        let (campaign_id, _) = seeded_contact(&db, "Jan", "+420111222333").await;
        let again = NewContact {
            campaign_id: Some(campaign_id),
            name: "Jan Novák".to_string(),
            phone: "+420111222333".to_string(),
            ..Default::default()
        };
        assert_eq!(db.add_contact(&again).await.unwrap(), AddContact::AlreadyExists);
        assert_eq!(db.list_contacts(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_identity_and_updates_outcome() {
        let db = Db::in_memory().await;
        let (_, contact_id) = seeded_contact(&db, "Jan", "+420111222333").await;

        let first = db.upsert_call(&new_call("CA1", Some(contact_id))).await.unwrap();
        let mut analyzed = new_call("CA1", None);
        analyzed.outcome = "interested".to_string();
        analyzed.sales_score = 65;
        analyzed.key_points = vec!["má starý web".to_string()];
        let second = db.upsert_call(&analyzed).await.unwrap();
        assert_eq!(first, second);

        let record = db.get_call_by_sid("CA1").await.unwrap().unwrap();
        assert_eq!(record.id, first);
        assert_eq!(record.call_sid, "CA1");
        assert_eq!(record.outcome, "interested");
        assert_eq!(record.sales_score, 65);
        assert_eq!(record.contact_id, Some(contact_id));
        assert_eq!(record.key_points.as_deref(), Some(r#"["má starý web"]"#));
        assert_eq!(db.list_calls(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filters_contacts_by_campaign_and_status() {
        let db = Db::in_memory().await;
        let (campaign_id, jan) = seeded_contact(&db, "Jan", "+420111222333").await;
        db.add_contact(&NewContact {
            name: "Eva".to_string(),
            phone: "+420777888999".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        db.update_contact_status(jan, ContactStatus::Calling).await.unwrap();

        assert_eq!(db.list_contacts(Some(campaign_id), None).await.unwrap().len(), 1);
        assert_eq!(db.list_contacts(None, Some(ContactStatus::Pending)).await.unwrap().len(), 1);
        let calling = db.list_contacts(Some(campaign_id), Some(ContactStatus::Calling)).await.unwrap();
        assert_eq!(calling[0].name, "Jan");
    }

    #[tokio::test]
    async fn campaign_completes_when_nothing_is_open() {
        let db = Db::in_memory().await;
        let (campaign_id, jan) = seeded_contact(&db, "Jan", "+420111222333").await;
        assert_eq!(db.refresh_campaign_status(campaign_id).await.unwrap(), CampaignStatus::Active);
        db.update_contact_status(jan, ContactStatus::Success).await.unwrap();
        assert_eq!(
            db.refresh_campaign_status(campaign_id).await.unwrap(),
            CampaignStatus::Completed
        );
        let campaign = db.get_campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "completed");
    }

    #[tokio::test]
    async fn stats_aggregate_contacts_and_calls() {
        let db = Db::in_memory().await;
        let (campaign_id, jan) = seeded_contact(&db, "Jan", "+420111222333").await;
        let eva = match db
            .add_contact(&NewContact {
                campaign_id: Some(campaign_id),
                name: "Eva".to_string(),
                phone: "+420777888999".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
        {
            AddContact::Added(id) => id,
            AddContact::AlreadyExists => unreachable!(),
        };
        db.update_contact_status(jan, ContactStatus::Success).await.unwrap();
        db.update_contact_status(eva, ContactStatus::Failed).await.unwrap();
        let mut won = new_call("CA1", Some(jan));
        won.outcome = "meeting_scheduled".to_string();
        won.sales_score = 90;
        db.upsert_call(&won).await.unwrap();
        let mut lost = new_call("CA2", Some(eva));
        lost.outcome = "rejected".to_string();
        lost.sales_score = 10;
        lost.duration_seconds = 20;
        db.upsert_call(&lost).await.unwrap();

        let stats = db.campaign_stats(campaign_id).await.unwrap();
        assert_eq!(stats.total_contacts, 2);
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.called, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.avg_score, 50.0);
        assert_eq!(stats.avg_duration, 31.0);

        let overall = db.overall_stats().await.unwrap();
        assert_eq!(overall.meetings, 1);
        assert_eq!(overall.success_rate, 50.0);
    }

    #[tokio::test]
    async fn empty_campaign_has_zero_stats() {
        let db = Db::in_memory().await;
        let campaign_id = db.create_campaign("Prázdná", Some("test")).await.unwrap();
        let stats = db.campaign_stats(campaign_id).await.unwrap();
        assert_eq!(stats, CampaignStats::default());
    }

    #[tokio::test]
    async fn csv_import_counts_duplicates_as_skipped() {
        let db = Db::in_memory().await;
        let campaign_id = db.create_campaign("Import", None).await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,phone,company,email").unwrap();
        writeln!(file, "Jan,+420111222333,Novák s.r.o.,jan@example.com").unwrap();
        writeln!(file, "Eva,+420777888999,,").unwrap();
        writeln!(file, "Jan znovu,+420111222333,,").unwrap();
        writeln!(file, "Bez čísla,,,").unwrap();

        let summary = db.import_contacts_csv(Some(campaign_id), file.path()).await.unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, skipped: 2 });
        let contacts = db.list_contacts(Some(campaign_id), None).await.unwrap();
        assert_eq!(contacts[0].company.as_deref(), Some("Novák s.r.o."));
        assert_eq!(contacts[1].company, None);
    }

    #[tokio::test]
    async fn dead_letters_are_listed_newest_first() {
        let db = Db::in_memory().await;
        db.insert_dead_letter("CA1", "timeout", "{}").await.unwrap();
        db.insert_dead_letter("CA2", "quota", "{}").await.unwrap();
        let letters = db.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].call_sid, "CA2");
    }
}
