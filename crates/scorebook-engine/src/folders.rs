//! Folder membership and its flat `(folder, chart)` lookup cache.

use std::collections::BTreeSet;

use futures::future::join_all;
use scorebook_core::{Chart, Folder, FolderChartLookup, FolderKind};
use scorebook_storage::{Database, Filter, FindOptions};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Folder queries spell nested fields with `¬` because `.` is not allowed in stored keys.
fn transpose_keys(query: &Map<String, Value>) -> Map<String, Value> {
    query
        .iter()
        .map(|(k, v)| (k.replace('¬', "."), v.clone()))
        .collect()
}

pub async fn resolve_folder_to_charts(db: &Database, folder: &Folder) -> Result<Vec<Chart>, EngineError> {
    let scope = Filter::new()
        .eq("game", folder.game.as_str())
        .eq("playtype", folder.playtype.as_str());

    let charts = match &folder.kind {
        FolderKind::Static(chart_ids) => {
            db.charts
                .find(
                    &scope.is_in("chartId", chart_ids.iter().cloned()),
                    &FindOptions::default(),
                )
                .await?
        }
        FolderKind::Songs(query) => {
            let songs = db
                .songs
                .find(
                    &Filter::from_query(query)?.eq("game", folder.game.as_str()),
                    &FindOptions::default(),
                )
                .await?;
            db.charts
                .find(
                    &scope.is_in("songId", songs.iter().map(|s| s.song_id)),
                    &FindOptions::default(),
                )
                .await?
        }
        FolderKind::Charts(query) => {
            let filter = Filter::from_query(&transpose_keys(query))?.and(scope);
            db.charts.find(&filter, &FindOptions::default()).await?
        }
    };
    Ok(charts)
}

/// Brings the lookup rows for one folder in line with its current membership.
/// Returns the number of charts in the folder.
pub async fn create_folder_chart_lookup(db: &Database, folder: &Folder) -> Result<usize, EngineError> {
    let charts = resolve_folder_to_charts(db, folder).await?;
    let members: BTreeSet<String> = charts.into_iter().map(|c| c.chart_id).collect();

    let rows = members
        .iter()
        .map(|chart_id| FolderChartLookup {
            folder_id: folder.folder_id.clone(),
            chart_id: chart_id.clone(),
        })
        .collect();
    let report = db.folder_chart_lookup.bulk_upsert(rows).await;
    if !report.failed.is_empty() {
        warn!(folder_id = %folder.folder_id, failed = report.failed.len(), "some folder lookup rows were not written");
    }

    let pruned = db
        .folder_chart_lookup
        .delete_many(
            &Filter::new()
                .eq("folderId", folder.folder_id.as_str())
                .not_in("chartId", members.iter().cloned()),
        )
        .await?;
    debug!(folder_id = %folder.folder_id, charts = members.len(), pruned, "refreshed folder lookup");
    Ok(members.len())
}

/// Flushes the whole lookup table and rebuilds every folder concurrently.
pub async fn initialise_folder_chart_lookup(db: &Database) -> Result<usize, EngineError> {
    info!("started folder chart lookup rebuild");
    let flushed = db.folder_chart_lookup.delete_many(&Filter::new()).await?;
    info!(flushed, "flushed folder chart lookup");

    let folders = db.folders.find(&Filter::new(), &FindOptions::default()).await?;
    info!(folders = folders.len(), "reloading folders");

    let results = join_all(folders.iter().map(|f| create_folder_chart_lookup(db, f))).await;
    let mut rows = 0;
    for (folder, result) in folders.iter().zip(results) {
        match result {
            Ok(count) => rows += count,
            Err(err) => warn!(folder_id = %folder.folder_id, error = %err, "failed to resolve folder"),
        }
    }

    info!(rows, "completed folder chart lookup rebuild");
    Ok(rows)
}

/// Charts cached for a folder. An empty folder is fine; an unknown one is an error.
pub async fn get_folder_chart_ids(db: &Database, folder_id: &str) -> Result<Vec<String>, EngineError> {
    let rows = db
        .folder_chart_lookup
        .find(&Filter::new().eq("folderId", folder_id), &FindOptions::default())
        .await?;
    if rows.is_empty() && db.folders.count(&Filter::new().eq("folderId", folder_id)).await? == 0 {
        return Err(EngineError::FolderNotFound(folder_id.to_string()));
    }
    Ok(rows.into_iter().map(|r| r.chart_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mk_chart;
    use scorebook_core::{Game, Playtype, Song};
    use serde_json::json;

    fn mk_folder(folder_id: &str, kind: FolderKind) -> Folder {
        Folder {
            folder_id: folder_id.to_string(),
            game: Game::Iidx,
            playtype: Playtype::Sp,
            title: folder_id.to_string(),
            inactive: false,
            kind,
        }
    }

    fn query(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn seed(db: &Database) {
        let mut c1 = mk_chart("c1", Game::Iidx, Playtype::Sp, 12.0);
        c1.data.insert("inGameInfo".into(), json!({ "version": "27" }));
        let mut c2 = mk_chart("c2", Game::Iidx, Playtype::Sp, 11.0);
        c2.song_id = 2;
        let dp = mk_chart("c3", Game::Iidx, Playtype::Dp, 12.0);
        db.charts.bulk_upsert(vec![c1, c2, dp]).await;
        db.songs
            .bulk_upsert(vec![
                Song {
                    song_id: 1,
                    game: Game::Iidx,
                    title: "A".into(),
                    artist: "X".into(),
                    search_terms: Vec::new(),
                    data: Map::new(),
                },
                Song {
                    song_id: 2,
                    game: Game::Iidx,
                    title: "B".into(),
                    artist: "Y".into(),
                    search_terms: Vec::new(),
                    data: Map::new(),
                },
            ])
            .await;
    }

    async fn chart_ids(db: &Database, folder: &Folder) -> Vec<String> {
        resolve_folder_to_charts(db, folder)
            .await
            .expect("resolve")
            .into_iter()
            .map(|c| c.chart_id)
            .collect()
    }

    #[tokio::test]
    async fn every_folder_kind_resolves_within_its_playtype() {
        let db = Database::in_memory();
        seed(&db).await;

        let fixed = mk_folder("static", FolderKind::Static(vec!["c2".into(), "c3".into()]));
        assert_eq!(chart_ids(&db, &fixed).await, ["c2"]);

        let by_artist = mk_folder("songs", FolderKind::Songs(query(json!({ "artist": "X" }))));
        assert_eq!(chart_ids(&db, &by_artist).await, ["c1"]);

        let level = mk_folder("level", FolderKind::Charts(query(json!({ "levelNum": 12.0 }))));
        assert_eq!(chart_ids(&db, &level).await, ["c1"]);

        let nested = mk_folder(
            "version",
            FolderKind::Charts(query(json!({ "data¬inGameInfo¬version": "27" }))),
        );
        assert_eq!(chart_ids(&db, &nested).await, ["c1"]);

        let range = mk_folder("range", FolderKind::Charts(query(json!({ "levelNum": { "$gte": 11 } }))));
        assert_eq!(chart_ids(&db, &range).await, ["c1", "c2"]);
    }

    #[tokio::test]
    async fn lookup_rebuild_upserts_then_prunes() {
        let db = Database::in_memory();
        seed(&db).await;
        let mut folder = mk_folder("f1", FolderKind::Static(vec!["c1".into(), "c2".into()]));

        assert_eq!(create_folder_chart_lookup(&db, &folder).await.expect("lookup"), 2);
        assert_eq!(create_folder_chart_lookup(&db, &folder).await.expect("lookup"), 2);
        assert_eq!(get_folder_chart_ids(&db, "f1").await.expect("ids").len(), 2);

        folder.kind = FolderKind::Static(vec!["c2".into()]);
        create_folder_chart_lookup(&db, &folder).await.expect("lookup");
        assert_eq!(get_folder_chart_ids(&db, "f1").await.expect("ids"), ["c2"]);
    }

    #[tokio::test]
    async fn full_rebuild_flushes_stale_folders() {
        let db = Database::in_memory();
        seed(&db).await;
        db.folder_chart_lookup
            .upsert(FolderChartLookup {
                folder_id: "deleted".into(),
                chart_id: "c1".into(),
            })
            .await
            .expect("stale");
        db.folders
            .bulk_upsert(vec![
                mk_folder("a", FolderKind::Static(vec!["c1".into()])),
                mk_folder("b", FolderKind::Charts(query(json!({ "levelNum": 11.0 })))),
            ])
            .await;

        assert_eq!(initialise_folder_chart_lookup(&db).await.expect("rebuild"), 2);
        assert!(matches!(
            get_folder_chart_ids(&db, "deleted").await,
            Err(EngineError::FolderNotFound(id)) if id == "deleted"
        ));
        assert_eq!(get_folder_chart_ids(&db, "b").await.expect("ids"), ["c2"]);
    }
}
