/// PostgreSQL export of the gauge registry
///
/// The JSON registry is the primary output; this module mirrors it into the
/// `discovery` schema (sql/001_discovery_schema.sql) for collaborators that
/// query gauges alongside other flood data. Exports are upserts keyed on the
/// gauge id, so re-exporting after a reclassification updates rows in place.

use crate::alert::thresholds::ThresholdCache;
use crate::logging::{self, LogSource};
use crate::report::RegistryReport;
use postgres::{Client, NoTls};
use std::collections::BTreeMap;
use std::env;
use thiserror::Error;

pub const DISCOVERY_SCHEMA: &str = "discovery";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("DATABASE_URL is not set (add it to .env)")]
    MissingUrl,
    #[error("schema '{0}' not found, apply sql/001_discovery_schema.sql")]
    MissingSchema(String),
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
}

/// Connect using `DATABASE_URL` from the environment or `.env`.
pub fn connect_from_env() -> Result<Client, DbError> {
    dotenv::dotenv().ok();
    let url = env::var("DATABASE_URL").map_err(|_| DbError::MissingUrl)?;
    Ok(Client::connect(&url, NoTls)?)
}

/// Connect and check that every schema in `schemas` exists.
pub fn connect_and_verify(schemas: &[&str]) -> Result<Client, DbError> {
    let mut client = connect_from_env()?;
    for schema in schemas {
        let row = client.query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
            &[schema],
        )?;
        if !row.get::<_, bool>(0) {
            return Err(DbError::MissingSchema(schema.to_string()));
        }
    }
    Ok(client)
}

/// Upsert every registry entry. Returns the number of rows written.
pub fn upsert_registry(client: &mut Client, report: &RegistryReport) -> Result<u64, DbError> {
    let mut tx = client.transaction()?;
    let stmt = tx.prepare(
        "INSERT INTO discovery.gauge_registry
            (gauge_id, latitude, longitude, source, site_name, river,
             quality_verified, has_model, tier, score, matched_station,
             evidence, discovered_at, exported_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         ON CONFLICT (gauge_id) DO UPDATE SET
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            source = EXCLUDED.source,
            site_name = EXCLUDED.site_name,
            river = EXCLUDED.river,
            quality_verified = EXCLUDED.quality_verified,
            has_model = EXCLUDED.has_model,
            tier = EXCLUDED.tier,
            score = EXCLUDED.score,
            matched_station = EXCLUDED.matched_station,
            evidence = EXCLUDED.evidence,
            exported_at = EXCLUDED.exported_at",
    )?;

    let mut written = 0;
    for g in &report.gauges {
        let tier = g.tier.map(|t| t.as_str().to_string());
        let score = g.score.map(i16::from);
        written += tx.execute(
            &stmt,
            &[
                &g.gauge_id,
                &g.latitude,
                &g.longitude,
                &g.source,
                &g.site_name,
                &g.river,
                &g.quality_verified,
                &g.has_model,
                &tier,
                &score,
                &g.matched_station,
                &g.evidence,
                &g.discovered_at,
                &report.generated_at,
            ],
        )?;
    }
    tx.commit()?;

    logging::info(
        LogSource::Database,
        None,
        &format!("Exported {} gauges to {}.gauge_registry", written, DISCOVERY_SCHEMA),
    );
    Ok(written)
}

/// Upsert every cached threshold set.
pub fn upsert_thresholds(client: &mut Client, cache: &ThresholdCache) -> Result<u64, DbError> {
    let mut tx = client.transaction()?;
    let stmt = tx.prepare(
        "INSERT INTO discovery.gauge_thresholds
            (gauge_id, warning_level, danger_level, extreme_danger_level, unit, refreshed_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (gauge_id) DO UPDATE SET
            warning_level = EXCLUDED.warning_level,
            danger_level = EXCLUDED.danger_level,
            extreme_danger_level = EXCLUDED.extreme_danger_level,
            unit = EXCLUDED.unit,
            refreshed_at = EXCLUDED.refreshed_at",
    )?;

    let mut written = 0;
    for entry in cache.entries() {
        let unit = entry.unit.to_string();
        written += tx.execute(
            &stmt,
            &[
                &entry.gauge_id,
                &entry.warning_level,
                &entry.danger_level,
                &entry.extreme_danger_level,
                &unit,
                &entry.refreshed_at,
            ],
        )?;
    }
    tx.commit()?;

    logging::info(
        LogSource::Database,
        None,
        &format!("Exported {} threshold sets", written),
    );
    Ok(written)
}

/// Gauge count per tier as currently stored in the database.
pub fn tier_counts(client: &mut Client) -> Result<BTreeMap<String, i64>, DbError> {
    let rows = client.query(
        "SELECT COALESCE(tier, 'UNASSESSED'), COUNT(*)
         FROM discovery.gauge_registry
         GROUP BY 1
         ORDER BY 1",
        &[],
    )?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, i64>(1)))
        .collect())
}
