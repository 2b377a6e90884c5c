//! Behavioural properties of query sets, checked against a small fixture
//! whose expected answers are computed in memory.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};

use strata_core::{StrataError, StrataResult};
use strata_db::model::{ColumnDef, Model, ModelDescriptor, SemanticType};
use strata_db::query::lookups::{parse, LookupKind};
use strata_db::query::{Aggregate, Instance};
use strata_db::router::ConnectionRouter;
use strata_db::value::Value;
use strata_db::{lookups, DatabaseBackendType, Manager};
use strata_test::{assert_num_queries, CallLog, RecordingFactory, TestDatabase};

#[derive(Debug, Clone)]
struct Item {
    id: i64,
    name: String,
    score: Option<i64>,
}

static ITEMS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
    ModelDescriptor::builder("items")
        .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
        .column(ColumnDef::new("name", SemanticType::Text))
        .column(ColumnDef::new("score", SemanticType::Integer).nullable())
        .build()
        .unwrap()
});

impl Model for Item {
    fn descriptor() -> &'static ModelDescriptor {
        &ITEMS
    }

    fn from_instance(instance: &Instance) -> StrataResult<Self> {
        Ok(Self {
            id: instance.get("id")?,
            name: instance.get("name")?,
            score: instance.get("score")?,
        })
    }
}

const FIXTURE: [(&str, Option<i64>); 7] = [
    ("Alpha", Some(10)),
    ("alphabet", Some(20)),
    ("Beta", None),
    ("gamma ray", Some(30)),
    ("100%_pure", Some(5)),
    ("DELTA", Some(20)),
    ("ÉCOLE", Some(15)),
];

fn fixture() -> Vec<Item> {
    (1..)
        .zip(FIXTURE)
        .map(|(id, (name, score))| Item {
            id,
            name: name.to_string(),
            score,
        })
        .collect()
}

async fn seeded() -> TestDatabase {
    let db = TestDatabase::new();
    db.setup_table(&ITEMS).await.unwrap();
    let items = Item::objects().using(db.connection());
    for (name, score) in FIXTURE {
        items
            .create(lookups! { "name" => name, "score" => score })
            .unwrap()
            .await
            .unwrap();
    }
    db.reset_query_count();
    db
}

fn items(db: &TestDatabase) -> Manager<Item> {
    Item::objects().with_router(db.router())
}

fn ids(items: &[Item]) -> BTreeSet<i64> {
    items.iter().map(|i| i.id).collect()
}

fn score_cmp(item: &Item, f: impl Fn(i64) -> bool) -> bool {
    item.score.is_some_and(f)
}

type Predicate = fn(&Item) -> bool;
type Case = (&'static str, Value, Predicate);

fn case(key: &'static str, value: impl Into<Value>, predicate: Predicate) -> Case {
    (key, value.into(), predicate)
}

/// One lookup per operator, plus the null forms of `exact` and `isnull`.
fn cases() -> Vec<Case> {
    vec![
        case("name", "Alpha", |i| i.name == "Alpha"),
        case("score", Value::Null, |i| i.score.is_none()),
        case("name__iexact", "ALPHA", |i| i.name.to_lowercase() == "alpha"),
        case("score__gt", 10, |i| score_cmp(i, |s| s > 10)),
        case("score__gte", 20, |i| score_cmp(i, |s| s >= 20)),
        case("score__lt", 20, |i| score_cmp(i, |s| s < 20)),
        case("score__lte", 10, |i| score_cmp(i, |s| s <= 10)),
        case("name__contains", "a", |i| i.name.contains('a')),
        case("name__contains", "%_", |i| i.name.contains("%_")),
        case("name__icontains", "ALPHA", |i| {
            i.name.to_lowercase().contains("alpha")
        }),
        case("name__icontains", "éco", |i| i.name.to_lowercase().contains("éco")),
        case("name__iexact", "école", |i| i.name.to_lowercase() == "école"),
        case("name__startswith", "al", |i| i.name.starts_with("al")),
        case("name__istartswith", "AL", |i| {
            i.name.to_lowercase().starts_with("al")
        }),
        case("name__endswith", "a", |i| i.name.ends_with('a')),
        case("name__iendswith", "A", |i| i.name.to_lowercase().ends_with('a')),
        case("name__iendswith", "OLE", |i| i.name.to_lowercase().ends_with("ole")),
        case(
            "score__in",
            Value::list([Value::from(10), Value::from(30), Value::Null]),
            |i| score_cmp(i, |s| s == 10 || s == 30),
        ),
        case("score__isnull", true, |i| i.score.is_none()),
        case("score__isnull", false, |i| i.score.is_some()),
        case("score__range", (5, 20), |i| score_cmp(i, |s| (5..=20).contains(&s))),
    ]
}

#[test]
fn test_cases_cover_every_lookup_kind() {
    let covered: HashSet<LookupKind> = cases()
        .into_iter()
        .map(|(key, value, _)| parse(key, value, &ITEMS).unwrap().operator())
        .collect();
    for kind in LookupKind::ALL {
        assert!(covered.contains(&kind), "no case exercises {kind}");
    }
}

#[tokio::test]
async fn test_filter_matches_in_memory_predicate() {
    let db = seeded().await;
    let rows = fixture();
    for (key, value, predicate) in cases() {
        let expected: BTreeSet<i64> = rows.iter().filter(|i| predicate(i)).map(|i| i.id).collect();
        let found = items(&db)
            .filter([(key, value.clone())])
            .unwrap()
            .all()
            .await
            .unwrap();
        assert_eq!(ids(&found), expected, "filter {key}={value}");
    }
}

#[tokio::test]
async fn test_exclude_is_the_complement_of_filter() {
    let db = seeded().await;
    let everything = ids(&fixture());
    for (key, value, _) in cases() {
        let kept = ids(&items(&db).filter([(key, value.clone())]).unwrap().all().await.unwrap());
        let dropped = ids(&items(&db).exclude([(key, value.clone())]).unwrap().all().await.unwrap());
        assert!(kept.is_disjoint(&dropped), "{key}={value}");
        let union: BTreeSet<i64> = kept.union(&dropped).copied().collect();
        assert_eq!(union, everything, "exclude {key}={value}");
    }
}

#[tokio::test]
async fn test_chaining_leaves_the_receiver_unchanged() {
    let db = seeded().await;
    let base = items(&db).all();
    let before = base.to_sql(DatabaseBackendType::SQLite);

    let narrowed = base
        .filter([("score__gte", 20)])
        .unwrap()
        .order_by(["-score", "name"])
        .unwrap()
        .limit(1);
    let _ = base.exclude([("name", "Beta")]).unwrap().distinct().reverse();

    assert_eq!(base.to_sql(DatabaseBackendType::SQLite), before);
    assert_eq!(base.count().await.unwrap(), 7);

    let top = narrowed.all().await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, "gamma ray");

    // A derived set can be refined again without touching its parent.
    let second = narrowed.offset(1);
    assert_eq!(second.all().await.unwrap()[0].name, "DELTA");
    assert_eq!(narrowed.all().await.unwrap()[0].name, "gamma ray");
}

#[tokio::test]
async fn test_unbounded_limit_returns_every_row() {
    let db = seeded().await;
    let everything = items(&db).all().limit(u64::MAX).all().await.unwrap();
    assert_eq!(ids(&everything), ids(&fixture()));
    let tail = items(&db).all().order_by(["id"]).unwrap().offset(5).limit(u64::MAX);
    assert_eq!(ids(&tail.all().await.unwrap()), BTreeSet::from([6, 7]));
}

#[tokio::test]
async fn test_get_requires_exactly_one_row() {
    let db = seeded().await;
    let found = items(&db).get([("name", "Beta")]).unwrap().await.unwrap();
    assert_eq!(found.id, 3);
    assert_eq!(found.score, None);

    let err = items(&db).get([("name", "Omega")]).unwrap().await.unwrap_err();
    assert!(matches!(err, StrataError::DoesNotExist(_)), "{err:?}");

    let err = items(&db).get([("score", 20)]).unwrap().await.unwrap_err();
    assert!(matches!(err, StrataError::MultipleObjectsReturned(_)), "{err:?}");

    assert!(items(&db)
        .get_or_none([("name", "Omega")])
        .unwrap()
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_aggregates_over_no_rows() {
    let db = TestDatabase::new();
    db.setup_table(&ITEMS).await.unwrap();

    let summary = items(&db)
        .all()
        .aggregate([
            ("n", Aggregate::count("id")),
            ("total", Aggregate::sum("score")),
            ("mean", Aggregate::avg("score")),
        ])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(summary.get("n"), Some(&Value::Int(0)));
    assert_eq!(summary.get("total"), Some(&Value::Null));
    assert_eq!(summary.get("mean"), Some(&Value::Null));
    assert_eq!(items(&db).count().await.unwrap(), 0);
    assert!(!items(&db).exists().await.unwrap());
}

#[tokio::test]
async fn test_none_never_reaches_the_database() {
    let db = seeded().await;
    assert_num_queries(&db, 0, || async {
        let empty = items(&db).none();
        assert!(empty.all().await.unwrap().is_empty());
        assert_eq!(empty.count().await.unwrap(), 0);
        assert_eq!(empty.update([("score", 1)]).unwrap().await.unwrap(), 0);
        assert_eq!(empty.delete().unwrap().await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_reads_go_to_replicas_and_writes_to_the_primary() {
    let db = seeded().await;
    let log = CallLog::new();
    let router = Arc::new(
        ConnectionRouter::new(Arc::new(RecordingFactory::new("primary", db.clone(), &log)))
            .with_replicas(vec![Arc::new(RecordingFactory::new(
                "replica",
                db.clone(),
                &log,
            ))]),
    );
    let items = Item::objects().with_router(router);

    let high = items.filter([("score__gte", 20)]).unwrap();
    assert_eq!(high.all().await.unwrap().len(), 3);
    assert_eq!(high.count().await.unwrap(), 3);
    items.get([("name", "Alpha")]).unwrap().await.unwrap();
    assert_eq!(log.entries(), ["replica", "replica", "replica"]);

    log.clear();
    assert_eq!(high.update([("score", 99)]).unwrap().await.unwrap(), 3);
    items.create(lookups! { "name" => "Epsilon" }).unwrap().await.unwrap();
    assert_eq!(
        items.filter([("name", "Epsilon")]).unwrap().delete().unwrap().await.unwrap(),
        1
    );
    assert_eq!(log.entries(), ["primary", "primary", "primary"]);
}
