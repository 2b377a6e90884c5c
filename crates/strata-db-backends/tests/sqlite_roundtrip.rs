//! Query sets executed against a real SQLite database.
//!
//! Each test opens a private in-memory database, creates the schema with
//! raw statements and then drives everything else through the query API:
//! compilation, execution and materialization together.

#![cfg(feature = "sqlite")]

use std::sync::{Arc, LazyLock};

use strata_core::{StrataError, StrataResult};
use strata_db::model::{ColumnDef, Model, ModelDescriptor, RelationDef, SemanticType};
use strata_db::query::Instance;
use strata_db::{lookups, Aggregate, Connection, ConnectionFactory, Manager, Value};
use strata_db_backends::SqliteFactory;

// ── Models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Author {
    id: i64,
    name: String,
    age: Option<i64>,
    active: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Book {
    id: i64,
    title: String,
    pages: i64,
    author_id: Option<i64>,
}

static AUTHORS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
    ModelDescriptor::builder("authors")
        .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
        .column(ColumnDef::new("name", SemanticType::Text))
        .column(ColumnDef::new("age", SemanticType::Integer).nullable())
        .column(ColumnDef::new("active", SemanticType::Boolean))
        .relation(RelationDef::one_to_many("books", books, "author_id"))
        .build()
        .unwrap()
});

static BOOKS: LazyLock<ModelDescriptor> = LazyLock::new(|| {
    ModelDescriptor::builder("books")
        .column(ColumnDef::new("id", SemanticType::Integer).primary_key())
        .column(ColumnDef::new("title", SemanticType::Text))
        .column(ColumnDef::new("pages", SemanticType::Integer))
        .column(ColumnDef::new("author_id", SemanticType::Integer).nullable())
        .relation(RelationDef::many_to_one("author", authors, "author_id"))
        .build()
        .unwrap()
});

fn authors() -> &'static ModelDescriptor {
    &AUTHORS
}

fn books() -> &'static ModelDescriptor {
    &BOOKS
}

impl Model for Author {
    fn descriptor() -> &'static ModelDescriptor {
        authors()
    }

    fn from_instance(instance: &Instance) -> StrataResult<Self> {
        Ok(Self {
            id: instance.get("id")?,
            name: instance.get("name")?,
            age: instance.get("age")?,
            active: instance.get("active")?,
        })
    }
}

impl Model for Book {
    fn descriptor() -> &'static ModelDescriptor {
        books()
    }

    fn from_instance(instance: &Instance) -> StrataResult<Self> {
        Ok(Self {
            id: instance.get("id")?,
            title: instance.get("title")?,
            pages: instance.get("pages")?,
            author_id: instance.get("author_id")?,
        })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

struct Db {
    conn: Arc<dyn Connection>,
}

impl Db {
    async fn open() -> Self {
        let conn = SqliteFactory::memory("default")
            .unwrap()
            .connect()
            .await
            .unwrap();
        conn.execute(
            "CREATE TABLE authors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                age INTEGER,
                active INTEGER NOT NULL DEFAULT 1
            )",
            &[],
        )
        .await
        .unwrap();
        conn.execute(
            "CREATE TABLE books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                pages INTEGER NOT NULL,
                author_id INTEGER REFERENCES authors(id)
            )",
            &[],
        )
        .await
        .unwrap();
        Self { conn }
    }

    fn authors(&self) -> Manager<Author> {
        Author::objects().using(Arc::clone(&self.conn))
    }

    fn books(&self) -> Manager<Book> {
        Book::objects().using(Arc::clone(&self.conn))
    }

    /// Ann (34, 2 books), Bob (27, 1 book), Cy (no age, inactive, no books),
    /// plus one book without an author.
    async fn seed(&self) {
        for (name, age, active) in [("Ann", Some(34), true), ("Bob", Some(27), true), ("Cy", None, false)] {
            self.authors()
                .create(lookups! { "name" => name, "age" => age, "active" => active })
                .unwrap()
                .await
                .unwrap();
        }
        for (title, pages, author) in [
            ("Dune", 412, Some(1)),
            ("Emma", 320, Some(1)),
            ("Ivanhoe", 510, Some(2)),
            ("Beowulf", 90, None),
        ] {
            self.books()
                .create(lookups! { "title" => title, "pages" => pages, "author_id" => author })
                .unwrap()
                .await
                .unwrap();
        }
    }
}

fn names(authors: &[Author]) -> Vec<&str> {
    authors.iter().map(|a| a.name.as_str()).collect()
}

// ── Create / read ────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_returns_generated_keys() {
    let db = Db::open().await;
    let first = db
        .authors()
        .create(lookups! { "name" => "Ann", "active" => true })
        .unwrap()
        .await
        .unwrap();
    let second = db
        .authors()
        .create(lookups! { "name" => "Bob", "active" => false })
        .unwrap()
        .await
        .unwrap();
    assert_eq!(first, Value::Int(1));
    assert_eq!(second, Value::Int(2));
    assert_eq!(db.authors().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_get_and_arity_errors() {
    let db = Db::open().await;
    db.seed().await;

    let ann = db.authors().get([("name", "Ann")]).unwrap().await.unwrap();
    assert_eq!(
        ann,
        Author {
            id: 1,
            name: "Ann".to_string(),
            age: Some(34),
            active: true,
        }
    );

    let missing = db.authors().get([("name", "Zed")]).unwrap().await.unwrap_err();
    assert!(matches!(missing, StrataError::DoesNotExist(_)));

    let many = db.authors().get([("active", true)]).unwrap().await.unwrap_err();
    assert!(matches!(many, StrataError::MultipleObjectsReturned(_)));

    assert!(db.authors().get_or_none([("name", "Zed")]).unwrap().await.unwrap().is_none());
}

#[tokio::test]
async fn test_filter_order_and_window() {
    let db = Db::open().await;
    db.seed().await;

    let adults = db
        .authors()
        .filter([("age__gte", 30)])
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(names(&adults), ["Ann"]);

    let by_age = db
        .authors()
        .filter([("age__isnull", false)])
        .unwrap()
        .order_by(["age"])
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(names(&by_age), ["Bob", "Ann"]);

    let page = db
        .authors()
        .all()
        .order_by(["-name"])
        .unwrap()
        .offset(1)
        .limit(1)
        .all()
        .await
        .unwrap();
    assert_eq!(names(&page), ["Bob"]);

    let last = db.authors().all().reverse().first().await.unwrap().unwrap();
    assert_eq!(last.name, "Cy");
}

#[tokio::test]
async fn test_exclude_keeps_null_rows() {
    let db = Db::open().await;
    db.seed().await;

    let rest = db
        .authors()
        .exclude([("age__gt", 30)])
        .unwrap()
        .order_by(["id"])
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(names(&rest), ["Bob", "Cy"]);
}

#[tokio::test]
async fn test_text_lookups() {
    let db = Db::open().await;
    db.seed().await;

    let count = |key: &'static str, needle: &'static str| {
        let qs = db.books().filter([(key, needle)]).unwrap();
        async move { qs.count().await.unwrap() }
    };
    assert_eq!(count("title__icontains", "an").await, 1);
    assert_eq!(count("title__contains", "an").await, 1);
    assert_eq!(count("title__contains", "AN").await, 0);
    assert_eq!(count("title__iexact", "dune").await, 1);
    assert_eq!(count("title__exact", "dune").await, 0);
    assert_eq!(count("title__istartswith", "e").await, 1);
    assert_eq!(count("title__endswith", "e").await, 2);
    // Wildcards in the needle match literally.
    assert_eq!(count("title__contains", "%").await, 0);
    assert_eq!(count("title__icontains", "_").await, 0);
}

#[tokio::test]
async fn test_in_and_range() {
    let db = Db::open().await;
    db.seed().await;

    let picked = db
        .books()
        .filter([("id__in", Value::list([2, 4, 9]))])
        .unwrap();
    assert_eq!(picked.count().await.unwrap(), 2);
    let narrowed = picked.filter([("id__in", Value::list([1, 2]))]).unwrap();
    assert_eq!(narrowed.count().await.unwrap(), 1);

    let with_null = db
        .books()
        .filter([("author_id__in", Value::list([Value::Int(2), Value::Null]))])
        .unwrap();
    assert_eq!(with_null.count().await.unwrap(), 1);

    let empty = db.books().filter([("id__in", Value::list(Vec::<i64>::new()))]).unwrap();
    assert_eq!(empty.count().await.unwrap(), 0);

    let mid = db.books().filter([("pages__range", Value::from((300, 420)))]).unwrap();
    assert_eq!(mid.count().await.unwrap(), 2);
}

// ── Relations ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_filter_across_relation() {
    let db = Db::open().await;
    db.seed().await;

    let anns = db
        .books()
        .filter([("author__name", "Ann")])
        .unwrap()
        .order_by(["title"])
        .unwrap()
        .all()
        .await
        .unwrap();
    let titles: Vec<_> = anns.iter().map(|b| b.title.as_str()).collect();
    assert_eq!(titles, ["Dune", "Emma"]);
}

#[tokio::test]
async fn test_select_related_forward() {
    let db = Db::open().await;
    db.seed().await;

    let rows = db
        .books()
        .all()
        .select_related(["author"])
        .unwrap()
        .order_by(["id"])
        .unwrap()
        .as_instances()
        .all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    let dune_author: Author = rows[0].related_model("author").unwrap().unwrap();
    assert_eq!(dune_author.name, "Ann");
    assert!(rows[3].related_one("author").unwrap().is_none());
}

#[tokio::test]
async fn test_select_related_one_to_many() {
    let db = Db::open().await;
    db.seed().await;

    let rows = db
        .authors()
        .all()
        .select_related(["books"])
        .unwrap()
        .order_by(["id"])
        .unwrap()
        .as_instances()
        .all()
        .await
        .unwrap();
    let counts: Vec<usize> = rows
        .iter()
        .map(|a| a.related_many("books").unwrap().len())
        .collect();
    assert_eq!(counts, [2, 1, 0]);
    let titles: Vec<String> = rows[0]
        .related_models::<Book>("books")
        .unwrap()
        .into_iter()
        .map(|b| b.title)
        .collect();
    assert_eq!(titles, ["Dune", "Emma"]);
}

// ── Projections and aggregates ───────────────────────────────────────

#[tokio::test]
async fn test_values_and_values_list() {
    let db = Db::open().await;
    db.seed().await;

    let records = db
        .authors()
        .filter([("active", true)])
        .unwrap()
        .order_by(["name"])
        .unwrap()
        .values(["name", "age"])
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].keys().collect::<Vec<_>>(), ["name", "age"]);
    assert_eq!(records[0].get("name"), Some(&Value::from("Ann")));

    let titles = db
        .books()
        .all()
        .order_by(["-pages"])
        .unwrap()
        .values_list(["title"])
        .unwrap()
        .flat()
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(
        titles,
        ["Ivanhoe", "Dune", "Emma", "Beowulf"].map(Value::from).to_vec()
    );

    let flags = db
        .authors()
        .all()
        .order_by(["id"])
        .unwrap()
        .values_list(["active"])
        .unwrap()
        .flat()
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(flags, [true, true, false].map(Value::from).to_vec());
}

#[tokio::test]
async fn test_aggregate() {
    let db = Db::open().await;
    db.seed().await;

    let stats = db
        .books()
        .filter([("author_id__isnull", false)])
        .unwrap()
        .aggregate([
            ("n", Aggregate::count("id")),
            ("total", Aggregate::sum("pages")),
            ("shortest", Aggregate::min("pages")),
            ("longest", Aggregate::max("pages")),
            ("mean", Aggregate::avg("pages")),
        ])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(stats.get("n"), Some(&Value::Int(3)));
    assert_eq!(stats.get("total"), Some(&Value::Int(1242)));
    assert_eq!(stats.get("shortest"), Some(&Value::Int(320)));
    assert_eq!(stats.get("longest"), Some(&Value::Int(510)));
    assert_eq!(stats.get("mean"), Some(&Value::Float(414.0)));

    let nothing = db
        .books()
        .filter([("pages__gt", 10_000)])
        .unwrap()
        .aggregate([("n", Aggregate::count("id")), ("total", Aggregate::sum("pages"))])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(nothing.get("n"), Some(&Value::Int(0)));
    assert_eq!(nothing.get("total"), Some(&Value::Null));
}

#[tokio::test]
async fn test_annotate_groups_rows() {
    let db = Db::open().await;
    db.seed().await;

    let per_author = db
        .books()
        .filter([("author_id__isnull", false)])
        .unwrap()
        .values(["author_id"])
        .unwrap()
        .annotate("n", &Aggregate::count("id"))
        .unwrap()
        .order_by(["-n"])
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(per_author.len(), 2);
    assert_eq!(per_author[0].get("author_id"), Some(&Value::Int(1)));
    assert_eq!(per_author[0].get("n"), Some(&Value::Int(2)));
    assert_eq!(per_author[1].get("n"), Some(&Value::Int(1)));
}

// ── Writes ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_and_delete() {
    let db = Db::open().await;
    db.seed().await;

    let updated = db
        .authors()
        .filter([("active", true)])
        .unwrap()
        .update(lookups! { "age" => Value::Null })
        .unwrap()
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(
        db.authors()
            .filter([("age__isnull", true)])
            .unwrap()
            .count()
            .await
            .unwrap(),
        3
    );

    let deleted = db
        .books()
        .filter([("pages__lt", 100)])
        .unwrap()
        .delete()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(db.books().count().await.unwrap(), 3);

    let none = db.books().none().delete().unwrap().await.unwrap();
    assert_eq!(none, 0);
    assert_eq!(db.books().count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_raw_query() {
    let db = Db::open().await;
    db.seed().await;

    let raw = db
        .authors()
        .raw(
            "SELECT id AS author_pk, name, age, active FROM authors WHERE age < ? ORDER BY id",
            vec![Value::Int(30)],
        )
        .translate([("author_pk", "id")]);
    let young = raw.all().await.unwrap();
    assert_eq!(names(&young), ["Bob"]);
    assert_eq!(young[0].id, 2);
}
