use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::object::{MigrationObject, SourceAnnotation};
use crate::repository::ContentRepository;
use crate::source::MigrationObjectSource;

/// A row a transform created or changed, identified by table and primary key.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProducedRecord {
    pub table: String,
    pub id: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TransformOutcome {
    pub produced: Vec<ProducedRecord>,
    pub detail: Option<String>,
}

impl TransformOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome for an object that needed no change.
    pub fn unchanged(detail: impl Into<String>) -> Self {
        Self {
            produced: Vec::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn produced(mut self, table: impl Into<String>, id: i64) -> Self {
        self.produced.push(ProducedRecord {
            table: table.into(),
            id,
        });
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One named migration step, applied to each unprocessed object in turn.
pub trait Transform {
    fn name(&self) -> &str;

    /// Applies the migration to `object`, recording a source annotation for every
    /// produced record.
    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Apply every transform inside one rolled-back pass and store no markers.
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedObject {
    pub object_id: String,
    pub position: usize,
    pub produced: Vec<ProducedRecord>,
    pub sources: Vec<SourceAnnotation>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_key: String,
    pub transform: String,
    pub dry_run: bool,
    pub total: usize,
    pub previously_processed: usize,
    pub processed: Vec<ProcessedObject>,
    /// Unprocessed objects left after this run (everything, under dry run).
    pub remaining: usize,
}

pub struct MigrationRun<'a, S, R, T>
where
    S: MigrationObjectSource + ?Sized,
    R: ContentRepository + ?Sized,
    T: Transform + ?Sized,
{
    source: &'a mut S,
    repository: &'a R,
    transform: &'a mut T,
    options: RunOptions,
}

impl<'a, S, R, T> MigrationRun<'a, S, R, T>
where
    S: MigrationObjectSource + ?Sized,
    R: ContentRepository + ?Sized,
    T: Transform + ?Sized,
{
    pub fn new(
        source: &'a mut S,
        repository: &'a R,
        transform: &'a mut T,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            repository,
            transform,
            options,
        }
    }

    /// Processes unprocessed objects in source order and stops at the first failure.
    /// Objects finished before the failure keep their markers.
    pub fn start(mut self) -> Result<RunReport> {
        let run_key = self.source.run_key().to_string();
        let source_key = self.source.source_key().to_string();
        let transform_name = self.transform.name().to_string();

        let committed = self.reconcile_markers(&run_key, &source_key)?;
        let pending: Vec<MigrationObject> = self
            .source
            .get_unprocessed()
            .into_iter()
            .filter(|object| !committed.contains(object.id()))
            .collect();
        let total = self.source.len();
        let previously_processed = total - pending.len();

        log::info!(
            "run `{run_key}` ({transform_name}): {} pending of {total}{}",
            pending.len(),
            if self.options.dry_run { " [dry run]" } else { "" }
        );

        // A dry run keeps every unit inside one pass so later objects see the
        // effects of earlier ones, then discards the whole pass.
        let processed = if self.options.dry_run {
            self.repository.begin_pass()?;
            let result = self.process_pending(&run_key, &source_key, pending);
            if let Err(rollback_err) = self.repository.rollback_pass() {
                if result.is_ok() {
                    return Err(rollback_err);
                }
                log::error!("failed to roll back dry run of `{run_key}`: {rollback_err:#}");
            }
            result?
        } else {
            self.process_pending(&run_key, &source_key, pending)?
        };

        let remaining = if self.options.dry_run {
            total - previously_processed
        } else {
            total - previously_processed - processed.len()
        };
        log::info!(
            "run `{run_key}` finished: {} {}, {remaining} remaining",
            processed.len(),
            if self.options.dry_run {
                "previewed"
            } else {
                "processed"
            }
        );

        Ok(RunReport {
            run_key,
            transform: transform_name,
            dry_run: self.options.dry_run,
            total,
            previously_processed,
            processed,
            remaining,
        })
    }

    /// Restores source markers for objects whose unit committed but whose
    /// marker never reached the source. Under dry run nothing is written; the
    /// committed ids are returned so they are still skipped.
    fn reconcile_markers(&mut self, run_key: &str, source_key: &str) -> Result<HashSet<String>> {
        let committed = self.repository.committed_markers(run_key, source_key)?;
        let mut unmirrored = HashSet::new();
        if committed.is_empty() {
            return Ok(unmirrored);
        }

        for mut object in self.source.get_unprocessed() {
            let Some(sources) = committed.get(object.id()) else {
                continue;
            };
            if self.options.dry_run {
                unmirrored.insert(object.id().to_string());
                continue;
            }
            log::warn!(
                "run `{run_key}`: object {} was committed without a stored marker; restoring it",
                object.id()
            );
            object.clear_sources();
            for annotation in sources {
                object.record_source(
                    annotation.table.as_str(),
                    annotation.column.as_str(),
                    annotation.id,
                    annotation.source_field.as_str(),
                );
            }
            self.source.store_processed_marker(&object)?;
        }
        Ok(unmirrored)
    }

    fn process_pending(
        &mut self,
        run_key: &str,
        source_key: &str,
        pending: Vec<MigrationObject>,
    ) -> Result<Vec<ProcessedObject>> {
        let budget = self.options.limit.unwrap_or(usize::MAX);
        let count = pending.len();
        let mut processed = Vec::new();
        for (index, mut object) in pending.into_iter().take(budget).enumerate() {
            log::debug!(
                "run `{run_key}`: object {} (record {}, {}/{count})",
                object.id(),
                object.position(),
                index + 1
            );
            object.clear_sources();

            let outcome = self
                .process_object(run_key, source_key, &mut object)
                .with_context(|| {
                    format!(
                        "run `{run_key}` stopped at object {} (record {})",
                        object.id(),
                        object.position()
                    )
                })?;

            log::info!(
                "run `{run_key}`: object {} {}{}",
                object.id(),
                if self.options.dry_run {
                    "previewed"
                } else {
                    "processed"
                },
                outcome
                    .detail
                    .as_deref()
                    .map(|detail| format!(" ({detail})"))
                    .unwrap_or_default()
            );
            processed.push(ProcessedObject {
                object_id: object.id().to_string(),
                position: object.position(),
                sources: object.sources().to_vec(),
                produced: outcome.produced,
                detail: outcome.detail,
            });
        }
        Ok(processed)
    }

    fn process_object(
        &mut self,
        run_key: &str,
        source_key: &str,
        object: &mut MigrationObject,
    ) -> Result<TransformOutcome> {
        self.repository.begin_unit()?;

        let applied = match self.transform.transform(object) {
            Ok(outcome) => verify_provenance(object, &outcome).map(|()| outcome),
            Err(err) => Err(err),
        };
        // The marker row shares the unit with the object's side effects.
        let applied = match applied {
            Ok(outcome) if !self.options.dry_run => self
                .repository
                .record_marker(run_key, source_key, object.id(), object.sources())
                .map(|()| outcome),
            other => other,
        };

        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback_err) = self.repository.rollback_unit() {
                    log::error!(
                        "failed to roll back object {}: {rollback_err:#}",
                        object.id()
                    );
                }
                log::error!("object {} failed: {err:#}", object.id());
                return Err(err);
            }
        };

        self.repository.commit_unit()?;
        if self.options.dry_run {
            return Ok(outcome);
        }

        self.source.store_processed_marker(object).with_context(|| {
            format!(
                "object {} is committed; its marker will be restored on the next run",
                object.id()
            )
        })?;
        Ok(outcome)
    }
}

/// Every annotation must point at a produced record and every produced record must be annotated.
pub fn verify_provenance(object: &MigrationObject, outcome: &TransformOutcome) -> Result<()> {
    for annotation in object.sources() {
        let matched = outcome
            .produced
            .iter()
            .any(|record| record.table == annotation.table && record.id == annotation.id);
        if !matched {
            bail!(
                "object {} records provenance for {}.{} = {} which the transform did not produce",
                object.id(),
                annotation.table,
                annotation.column,
                annotation.id
            );
        }
    }
    for record in &outcome.produced {
        let annotated = object
            .sources()
            .iter()
            .any(|annotation| annotation.table == record.table && annotation.id == record.id);
        if !annotated {
            bail!(
                "object {} produced {} row {} without recording its source",
                object.id(),
                record.table,
                record.id
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::anyhow;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::Durability;
    use crate::repository::{NewPost, POSTS, SqliteRepository, load_repository_stats, test_repository};
    use crate::runtime::ResolvedPaths;
    use crate::source::{JsonObjectSource, SourceOptions};

    /// Inserts one post per object titled by the `title` field; fails on `fail_on` titles.
    struct TitleToPost<'r> {
        repository: &'r SqliteRepository,
        fail_on: Vec<String>,
        skip_annotation: bool,
    }

    impl Transform for TitleToPost<'_> {
        fn name(&self) -> &str {
            "title-to-post"
        }

        fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
            let title = object.require_str("title")?.to_string();
            let post_id = self.repository.insert_post(&NewPost {
                post_title: title.clone(),
                post_status: "publish".to_string(),
                post_type: "post".to_string(),
                ..NewPost::default()
            })?;
            if self.fail_on.contains(&title) {
                return Err(anyhow!("refusing `{title}`"));
            }
            let table = self.repository.table(POSTS);
            if !self.skip_annotation {
                object.record_source(&table, "ID", post_id, "title");
            }
            Ok(TransformOutcome::new().produced(table, post_id))
        }
    }

    /// Inserts a post per object but refuses a title another post already has.
    struct UniqueTitle<'r> {
        repository: &'r SqliteRepository,
    }

    impl Transform for UniqueTitle<'_> {
        fn name(&self) -> &str {
            "unique-title"
        }

        fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
            let title = object.require_str("title")?.to_string();
            let mut candidate = 1;
            while let Some(post) = self.repository.find_post(candidate)? {
                if post.post_title == title {
                    bail!("title `{title}` already used by post {}", post.id);
                }
                candidate += 1;
            }
            let post_id = self.repository.insert_post(&NewPost {
                post_title: title,
                post_status: "publish".to_string(),
                post_type: "post".to_string(),
                ..NewPost::default()
            })?;
            let table = self.repository.table(POSTS);
            object.record_source(&table, "ID", post_id, "title");
            Ok(TransformOutcome::new().produced(table, post_id))
        }
    }

    struct Fixture {
        _temp: TempDir,
        paths: ResolvedPaths,
        repository: SqliteRepository,
        input: PathBuf,
        ledger: PathBuf,
    }

    fn fixture(records: &str) -> Fixture {
        let temp = tempdir().expect("tempdir");
        let (paths, repository) = test_repository(temp.path());
        let input = temp.path().join("titles.json");
        fs::write(&input, records).expect("write input");
        let ledger = paths.ledger_path_for(&input, "titles");
        Fixture {
            _temp: temp,
            paths,
            repository,
            input,
            ledger,
        }
    }

    fn load_source(input: &Path, ledger: &Path) -> JsonObjectSource {
        JsonObjectSource::load(
            input,
            ledger,
            "titles",
            &SourceOptions {
                id_field: None,
                durability: Durability::Sync,
            },
        )
        .expect("load source")
    }

    fn post_count(paths: &ResolvedPaths) -> usize {
        load_repository_stats(paths, "wp_")
            .expect("stats")
            .expect("tables")
            .posts
    }

    const FOUR: &str = r#"[{"title": "a"}, {"title": "b"}, {"title": "c"}, {"title": "d"}]"#;

    #[test]
    fn failure_at_k_marks_only_earlier_objects() {
        let fx = fixture(FOUR);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: vec!["c".to_string()],
            skip_annotation: false,
        };

        let err = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect_err("run must fail");
        assert!(format!("{err:#}").contains("stopped at object 3"));

        let reloaded = load_source(&fx.input, &fx.ledger);
        assert!(reloaded.is_processed("1"));
        assert!(reloaded.is_processed("2"));
        assert!(!reloaded.is_processed("3"));
        assert!(!reloaded.is_processed("4"));
        // the failing object's insert was rolled back
        assert_eq!(post_count(&fx.paths), 2);
    }

    #[test]
    fn rerun_after_fix_resumes_without_reprocessing() {
        let fx = fixture(FOUR);
        {
            let mut source = load_source(&fx.input, &fx.ledger);
            let mut transform = TitleToPost {
                repository: &fx.repository,
                fail_on: vec!["c".to_string()],
                skip_annotation: false,
            };
            let _ = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
                .start();
        }

        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: false,
        };
        let report = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect("second run");

        assert_eq!(report.previously_processed, 2);
        let ids: Vec<_> = report
            .processed
            .iter()
            .map(|item| item.object_id.as_str())
            .collect();
        assert_eq!(ids, vec!["3", "4"]);
        assert_eq!(report.remaining, 0);
        assert_eq!(post_count(&fx.paths), 4);

        let mut source = load_source(&fx.input, &fx.ledger);
        let report = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect("third run");
        assert!(report.processed.is_empty());
        assert_eq!(post_count(&fx.paths), 4);
    }

    #[test]
    fn provenance_references_produced_ids() {
        let fx = fixture(r#"[{"title": "a"}, {"title": "b"}]"#);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: false,
        };
        let report = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect("run");

        for item in &report.processed {
            assert_eq!(item.sources.len(), 1);
            assert_eq!(item.sources[0].id, item.produced[0].id);
            assert_eq!(item.sources[0].table, item.produced[0].table);
            let post = fx
                .repository
                .find_post(item.sources[0].id)
                .expect("load")
                .expect("post exists");
            assert_eq!(post.id, item.produced[0].id);
        }

        let ledger = crate::ledger::RunLedger::load(&fx.ledger, Durability::Sync)
            .expect("load ledger")
            .expect("ledger exists");
        assert_eq!(ledger.entries[0].sources, report.processed[0].sources);
    }

    #[test]
    fn missing_provenance_aborts_and_rolls_back() {
        let fx = fixture(r#"[{"title": "a"}]"#);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: true,
        };
        let err = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("without recording its source"));
        assert_eq!(post_count(&fx.paths), 0);
        assert!(!load_source(&fx.input, &fx.ledger).is_processed("1"));
    }

    #[test]
    fn dry_run_rolls_back_and_stores_no_markers() {
        let fx = fixture(FOUR);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: false,
        };
        let report = MigrationRun::new(
            &mut source,
            &fx.repository,
            &mut transform,
            RunOptions {
                dry_run: true,
                limit: None,
            },
        )
        .start()
        .expect("dry run");

        assert!(report.dry_run);
        assert_eq!(report.processed.len(), 4);
        assert_eq!(report.remaining, 4);
        assert_eq!(post_count(&fx.paths), 0);
        assert!(!fx.ledger.exists());
    }

    #[test]
    fn marker_lost_after_commit_is_restored_without_reapplying() {
        let fx = fixture(r#"[{"title": "a"}, {"title": "b"}]"#);
        let mut source = load_source(&fx.input, &fx.ledger);
        // Squatting on the ledger path makes the marker write fail after the
        // object's unit has committed.
        fs::create_dir_all(&fx.ledger).expect("block ledger path");
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: false,
        };
        let err = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect_err("marker write must fail");
        assert!(format!("{err:#}").contains("stopped at object 1"));
        assert_eq!(post_count(&fx.paths), 1);
        fs::remove_dir(&fx.ledger).expect("unblock ledger path");

        let mut source = load_source(&fx.input, &fx.ledger);
        assert!(!source.is_processed("1"));
        let preview = MigrationRun::new(
            &mut source,
            &fx.repository,
            &mut transform,
            RunOptions {
                dry_run: true,
                limit: None,
            },
        )
        .start()
        .expect("dry run");
        assert_eq!(preview.previously_processed, 1);
        assert_eq!(preview.processed.len(), 1);
        assert!(!fx.ledger.exists());

        let report = MigrationRun::new(&mut source, &fx.repository, &mut transform, RunOptions::default())
            .start()
            .expect("rerun");
        assert_eq!(report.previously_processed, 1);
        let ids: Vec<_> = report
            .processed
            .iter()
            .map(|item| item.object_id.as_str())
            .collect();
        assert_eq!(ids, vec!["2"]);
        assert_eq!(post_count(&fx.paths), 2);

        let ledger = crate::ledger::RunLedger::load(&fx.ledger, Durability::Sync)
            .expect("load ledger")
            .expect("ledger exists");
        assert!(ledger.is_processed("1"));
        assert!(ledger.is_processed("2"));
        let restored = &ledger.entries[0];
        assert_eq!(restored.object_id, "1");
        assert_eq!(restored.sources.len(), 1);
        assert_eq!(restored.sources[0].table, "wp_posts");
    }

    #[test]
    fn dry_run_sees_earlier_objects_of_the_same_pass() {
        let fx = fixture(r#"[{"title": "a"}, {"title": "a"}]"#);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = UniqueTitle {
            repository: &fx.repository,
        };
        let err = MigrationRun::new(
            &mut source,
            &fx.repository,
            &mut transform,
            RunOptions {
                dry_run: true,
                limit: None,
            },
        )
        .start()
        .expect_err("second object must conflict with the first");
        assert!(format!("{err:#}").contains("stopped at object 2"));
        assert_eq!(post_count(&fx.paths), 0);
        assert!(!fx.ledger.exists());
    }

    #[test]
    fn limit_caps_processed_objects() {
        let fx = fixture(FOUR);
        let mut source = load_source(&fx.input, &fx.ledger);
        let mut transform = TitleToPost {
            repository: &fx.repository,
            fail_on: Vec::new(),
            skip_annotation: false,
        };
        let report = MigrationRun::new(
            &mut source,
            &fx.repository,
            &mut transform,
            RunOptions {
                dry_run: false,
                limit: Some(3),
            },
        )
        .start()
        .expect("run");
        assert_eq!(report.processed.len(), 3);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn verify_provenance_rejects_orphaned_annotation() {
        let mut object = MigrationObject::new("1", 1, serde_json::Map::new());
        object.record_source("wp_posts", "ID", 9, "title");
        let outcome = TransformOutcome::new().produced("wp_posts", 10);
        let err = verify_provenance(&object, &outcome).expect_err("must fail");
        assert!(err.to_string().contains("did not produce"));

        let unchanged = TransformOutcome::unchanged("nothing to do");
        let clean = MigrationObject::new("2", 2, serde_json::Map::new());
        verify_provenance(&clean, &unchanged).expect("no-op outcome is valid");
    }
}
