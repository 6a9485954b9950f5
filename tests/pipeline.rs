use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use clonegen::detect::run_all;
use clonegen::history::{ImportOptions, read_snapshot_history, register_history};
use clonegen::index::lineage::ElementKind;
use clonegen::index::{SharedIndex, SqliteIndex};
use clonegen::pipeline::PipelineSettings;
use clonegen::vcs::Language;

fn loop_body(step: usize) -> String {
    format!(
        "int scan_{step}(int *v, int n) {{\n  int acc = 0;\n  while (n > 0) {{\n    acc += v[n] * {step};\n    n--;\n  }}\n  return acc;\n}}\n"
    )
}

const STABLE: &str = "void stable(void) {\n  if (ready) {\n    start(1, 2, 3);\n  }\n}\n";

fn write_revision(root: &Path, name: &str, files: &[(&str, String)]) {
    for (path, content) in files {
        let target = root.join(name).join(path);
        fs::create_dir_all(target.parent().expect("parent")).expect("dirs");
        fs::write(target, content).expect("write");
    }
}

fn settings(workers: usize) -> PipelineSettings {
    PipelineSettings {
        workers,
        flush_threshold: 4,
        poll_interval: Duration::from_millis(2),
        cross_project: false,
        clone_size_threshold: 10,
        link_similarity: 0.3,
    }
}

fn imported(root: &Path, options: &ImportOptions) -> SharedIndex {
    let language = Language::from_globs(&Language::default_globs()).expect("globs");
    let history = read_snapshot_history(root, options, &language).expect("history");
    let index = SqliteIndex::open_in_memory().expect("sqlite");
    register_history(&index, options, &history).expect("import");
    SharedIndex::new(index)
}

fn assert_partitioned(index: &SqliteIndex, kind: ElementKind) {
    let elements = index.element_refs(kind).expect("elements");
    let mut seen = HashSet::new();
    let mut total = 0;
    for element in &elements {
        let genealogy = index
            .genealogy_containing(kind, element.id)
            .expect("query")
            .unwrap_or_else(|| panic!("{} {} has no genealogy", kind.as_str(), element.id));
        if seen.insert(genealogy.id) {
            total += genealogy.elements.len();
            assert!(genealogy.start_revision <= genealogy.end_revision);
            assert_eq!(genealogy.links.len() + 1, genealogy.elements.len());
        }
    }
    assert_eq!(total, elements.len(), "{} elements partitioned", kind.as_str());
}

#[test]
fn genealogies_partition_all_elements_with_many_workers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    for revision in 0..6 {
        let mut files = vec![
            ("src/stable.c", STABLE.to_string()),
            ("src/copy.c", STABLE.to_string()),
            ("src/scan.c", loop_body(revision % 2 + 1)),
        ];
        if revision >= 3 {
            files.push(("src/late.c", loop_body(7)));
        }
        write_revision(root, &format!("rev{revision}"), &files);
    }

    let index = imported(root, &ImportOptions::default());
    let reports = run_all(&index, &settings(4)).expect("pipeline");
    assert_eq!(reports.len(), 6);
    assert!(reports.iter().all(|report| report.failures.is_empty()));

    let db = index.lock();
    let counts = db.counts().expect("counts");
    assert_eq!(counts["revisions"], 6);
    assert!(counts["fragment_links"] > 0);
    assert!(counts["clone_links"] > 0);
    assert_partitioned(&db, ElementKind::Fragment);
    assert_partitioned(&db, ElementKind::Clone);

    for kind in [ElementKind::Fragment, ElementKind::Clone] {
        let links = db.links(kind).expect("links");
        let mut befores = HashSet::new();
        let mut afters = HashSet::new();
        for link in &links {
            assert!(link.before_revision < link.after_revision);
            assert!(befores.insert(link.before_element), "before linked twice");
            assert!(afters.insert(link.after_element), "after linked twice");
        }
    }
}

#[test]
fn worker_count_does_not_change_the_outcome() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    for revision in 0..4 {
        write_revision(
            root,
            &format!("v{revision}"),
            &[
                ("a.c", loop_body(revision + 1)),
                ("b.c", STABLE.to_string()),
                ("c.c", STABLE.to_string()),
            ],
        );
    }

    let summary = |workers: usize| -> BTreeMap<&'static str, i64> {
        let index = imported(root, &ImportOptions::default());
        run_all(&index, &settings(workers)).expect("pipeline");
        index.into_inner().counts().expect("counts")
    };
    assert_eq!(summary(1), summary(3));
}

type Location = (i64, String, u32, u32);

fn locate(db: &SqliteIndex, id: i64) -> Location {
    let fragment = db.fragment(id).expect("query").expect("fragment exists");
    (
        fragment.revision_id,
        fragment.file_path,
        fragment.start_line,
        fragment.end_line,
    )
}

/// Fragment ids depend on which worker reaches a unit first, so outcomes are
/// compared by source location instead.
#[test]
fn fragments_and_links_match_by_location_across_worker_counts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    for revision in 0..5 {
        let mut files = vec![
            ("src/a.c", loop_body(revision % 3 + 1)),
            ("src/b.c", STABLE.to_string()),
            ("lib/c.c", STABLE.to_string()),
        ];
        if revision >= 2 {
            files.push(("lib/d.c", loop_body(9)));
        }
        write_revision(root, &format!("v{revision}"), &files);
    }

    let outcome = |workers: usize| {
        let index = imported(root, &ImportOptions::default());
        run_all(&index, &settings(workers)).expect("pipeline");
        let db = index.into_inner();
        let fragments = db
            .revisions()
            .expect("revisions")
            .iter()
            .flat_map(|revision| db.fragments_in_revision(revision.id).expect("fragments"))
            .map(|fragment| locate(&db, fragment.id))
            .collect::<BTreeSet<_>>();
        let links = db
            .links(ElementKind::Fragment)
            .expect("links")
            .iter()
            .map(|link| {
                (
                    locate(&db, link.before_element),
                    locate(&db, link.after_element),
                    link.changed,
                )
            })
            .collect::<BTreeSet<_>>();
        (fragments, links)
    };

    let (single_fragments, single_links) = outcome(1);
    let (many_fragments, many_links) = outcome(4);
    assert!(!single_links.is_empty());
    assert_eq!(single_fragments, many_fragments);
    assert_eq!(single_links, many_links);
}

#[test]
fn combined_history_keeps_sub_repositories_apart_unless_cross_project() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    for revision in 0..2 {
        write_revision(
            root,
            &format!("r{revision}"),
            &[
                ("alpha/one.c", STABLE.to_string()),
                ("beta/two.c", STABLE.to_string()),
            ],
        );
    }
    let options = ImportOptions {
        repository: "container".to_string(),
        combined: true,
    };

    let index = imported(root, &options);
    assert_eq!(index.lock().counts().expect("counts")["repositories"], 3);
    run_all(&index, &settings(2)).expect("pipeline");
    assert_eq!(index.lock().counts().expect("counts")["clone_sets"], 0);

    let cross = PipelineSettings {
        cross_project: true,
        ..settings(2)
    };
    run_all(&index, &cross).expect("pipeline");
    let db = index.lock();
    let counts = db.counts().expect("counts");
    assert_eq!(counts["clone_sets"], 4, "function and if block per revision");
    assert_eq!(counts["clone_links"], 2);
    assert_eq!(counts["clone_genealogies"], 2);
    assert_partitioned(&db, ElementKind::Clone);
}
