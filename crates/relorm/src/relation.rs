//! Entity metadata and batched eager loading.
//!
//! Relations are resolved per record list, never per record: for each relation
//! path one query fetches the children of every parent at once
//! (`WHERE fk IN (...)`), and nested paths recurse on the combined child list.
//! Loading `posts.comments` for N users therefore costs two queries, not
//! 1 + N + N*M.
//!
//! Entities are described with [`EntityMeta`] and collected in an
//! [`EntityRegistry`], either explicitly or through `inventory`:
//!
//! ```ignore
//! fn user() -> EntityMeta {
//!     EntityMeta::new("User", "users")
//!         .soft_delete("deleted_at")
//!         .has_many("posts", "Post", "user_id", "id")
//! }
//! relorm::inventory::submit! { relorm::EntityRegistration::new(user) }
//!
//! let registry = EntityRegistry::from_inventory();
//! ```

use crate::builder::Builder;
use crate::connection::Pool;
use crate::error::{OrmError, OrmResult};
use crate::grammar::StatementKind;
use crate::record::{Record, RecordList, Related};
use crate::session::Session;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Narrows the related-entity query of one eager-load path.
pub type RelationScope = Arc<dyn Fn(Builder) -> Builder + Send + Sync>;

/// How many related records a parent holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    One,
    Many,
}

/// A named relation from one entity to another.
///
/// Children match parents where `child.foreign_key == parent.local_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDecl {
    pub name: String,
    pub target: String,
    pub foreign_key: String,
    pub local_key: String,
    pub arity: Arity,
}

/// Table-level description of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMeta {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<String>,
    /// Timestamp column marking soft-deleted rows.
    pub soft_delete: Option<String>,
    pub relations: Vec<RelationDecl>,
}

impl EntityMeta {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            primary_key: "id".to_string(),
            columns: Vec::new(),
            soft_delete: None,
            relations: Vec::new(),
        }
    }

    pub fn primary_key(mut self, col: &str) -> Self {
        self.primary_key = col.to_string();
        self
    }

    pub fn columns(mut self, cols: &[&str]) -> Self {
        self.columns = cols.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn soft_delete(mut self, col: &str) -> Self {
        self.soft_delete = Some(col.to_string());
        self
    }

    pub fn relation(mut self, decl: RelationDecl) -> Self {
        self.relations.push(decl);
        self
    }

    fn decl(self, name: &str, target: &str, foreign_key: &str, local_key: &str, arity: Arity) -> Self {
        self.relation(RelationDecl {
            name: name.to_string(),
            target: target.to_string(),
            foreign_key: foreign_key.to_string(),
            local_key: local_key.to_string(),
            arity,
        })
    }

    /// Children whose `foreign_key` references this entity's `local_key`.
    pub fn has_many(self, name: &str, target: &str, foreign_key: &str, local_key: &str) -> Self {
        self.decl(name, target, foreign_key, local_key, Arity::Many)
    }

    pub fn has_one(self, name: &str, target: &str, foreign_key: &str, local_key: &str) -> Self {
        self.decl(name, target, foreign_key, local_key, Arity::One)
    }

    /// Parent referenced by this entity's `local_key` column, e.g.
    /// `belongs_to("author", "User", "id", "user_id")`.
    pub fn belongs_to(self, name: &str, target: &str, foreign_key: &str, local_key: &str) -> Self {
        self.decl(name, target, foreign_key, local_key, Arity::One)
    }

    pub fn find_relation(&self, name: &str) -> Option<&RelationDecl> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Entity submitted to the global registry through `inventory`.
pub struct EntityRegistration {
    pub build: fn() -> EntityMeta,
}

impl EntityRegistration {
    pub const fn new(build: fn() -> EntityMeta) -> Self {
        Self { build }
    }
}

inventory::collect!(EntityRegistration);

/// Entity name to metadata.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, Arc<EntityMeta>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entity submitted with `inventory::submit!`.
    pub fn from_inventory() -> Self {
        let mut registry = Self::new();
        for reg in inventory::iter::<EntityRegistration> {
            registry.register((reg.build)());
        }
        registry
    }

    /// Add or replace an entity.
    pub fn register(&mut self, meta: EntityMeta) -> &mut Self {
        self.entities.insert(meta.name.clone(), Arc::new(meta));
        self
    }

    pub fn with(mut self, meta: EntityMeta) -> Self {
        self.register(meta);
        self
    }

    pub fn get(&self, name: &str) -> OrmResult<Arc<EntityMeta>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::Config(format!("entity `{name}` is not registered")))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check that every relation targets a registered entity.
    pub fn validate(&self) -> OrmResult<()> {
        for meta in self.entities.values() {
            for rel in &meta.relations {
                if !self.entities.contains_key(&rel.target) {
                    return Err(OrmError::relation(
                        format!("{}.{}", meta.name, rel.name),
                        format!("target entity `{}` is not registered", rel.target),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One requested eager-load path.
#[derive(Clone)]
pub struct EagerLoad {
    pub path: String,
    pub scope: Option<RelationScope>,
}

impl EagerLoad {
    pub fn new(path: &str, scope: Option<RelationScope>) -> Self {
        Self {
            path: path.trim().to_string(),
            scope,
        }
    }
}

/// Relation tree built from dotted paths. Children are ordered by name.
#[derive(Default)]
struct PathNode {
    scope: Option<RelationScope>,
    children: BTreeMap<String, PathNode>,
}

fn build_tree(loads: &[EagerLoad]) -> OrmResult<PathNode> {
    let mut root = PathNode::default();
    for load in loads {
        if load.path.is_empty() || load.path.split('.').any(str::is_empty) {
            return Err(OrmError::relation(load.path.clone(), "malformed relation path"));
        }
        let mut node = &mut root;
        for segment in load.path.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        // The scope belongs to the last segment; a later scope for the same path wins.
        if load.scope.is_some() {
            node.scope = load.scope.clone();
        }
    }
    Ok(root)
}

type LoadFuture<'a> = Pin<Box<dyn Future<Output = OrmResult<()>> + Send + 'a>>;

/// Resolve `loads` on `list`, a record list of entity `meta`.
pub(crate) async fn eager_load<P: Pool>(
    session: &mut Session<P>,
    meta: &Arc<EntityMeta>,
    list: &mut RecordList,
    loads: &[EagerLoad],
) -> OrmResult<()> {
    let tree = build_tree(loads)?;
    let mut resolved = HashSet::new();
    load_level(session, meta.clone(), list, &tree, String::new(), &mut resolved).await
}

fn load_level<'a, P: Pool>(
    session: &'a mut Session<P>,
    meta: Arc<EntityMeta>,
    list: &'a mut RecordList,
    node: &'a PathNode,
    prefix: String,
    resolved: &'a mut HashSet<String>,
) -> LoadFuture<'a> {
    Box::pin(async move {
        for (name, child) in &node.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            if !resolved.insert(path.clone()) {
                continue;
            }
            resolve_one(session, &meta, list, name, child, path, resolved).await?;
        }
        Ok(())
    })
}

async fn resolve_one<P: Pool>(
    session: &mut Session<P>,
    meta: &EntityMeta,
    list: &mut RecordList,
    name: &str,
    node: &PathNode,
    path: String,
    resolved: &mut HashSet<String>,
) -> OrmResult<()> {
    let decl = meta.find_relation(name).ok_or_else(|| {
        OrmError::relation(path.clone(), format!("`{}` has no relation `{name}`", meta.name))
    })?;
    let target = session
        .registry()
        .get(&decl.target)
        .map_err(|e| OrmError::relation(path.clone(), e.to_string()))?;

    // Parents that already hold this relation keep it.
    let pending: Vec<usize> = list
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.has_relation(name))
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let mut seen = HashSet::new();
    let keys: Vec<Value> = pending
        .iter()
        .filter_map(|&i| list.get(i)?.get(&decl.local_key))
        .filter(|v| !v.is_null() && seen.insert((*v).clone()))
        .cloned()
        .collect();

    let mut children = if keys.is_empty() {
        RecordList::new(Some(Arc::from(target.name.as_str())), Vec::new())
    } else {
        let mut query =
            Builder::for_entity(target.clone(), session.dialect()).where_in(&decl.foreign_key, keys);
        if let Some(scope) = &node.scope {
            query = scope(query);
        }
        let stmt = query.to_statement(StatementKind::Select)?;
        let rows = session
            .fetch(&stmt)
            .await
            .map_err(|e| annotate(e, &path))?;
        RecordList::from_rows(Some(Arc::from(target.name.as_str())), rows)
    };

    tracing::debug!(
        target: "relorm.relation",
        path = %path,
        parents = pending.len(),
        children = children.len(),
        "resolved relation"
    );

    if !node.children.is_empty() && !children.is_empty() {
        load_level(session, target.clone(), &mut children, node, path, resolved).await?;
    }

    let mut by_key: HashMap<Value, Vec<Record>> = HashMap::new();
    for child in children {
        if let Some(fk) = child.get(&decl.foreign_key).filter(|v| !v.is_null()).cloned() {
            by_key.entry(fk).or_default().push(child);
        }
    }

    let entity: Arc<str> = Arc::from(target.name.as_str());
    for idx in pending {
        let Some(parent) = list.records_mut().get_mut(idx) else {
            continue;
        };
        let matched = parent
            .get(&decl.local_key)
            .and_then(|key| by_key.get(key))
            .cloned()
            .unwrap_or_default();
        let related = match decl.arity {
            Arity::Many => Related::Many(RecordList::new(Some(entity.clone()), matched)),
            Arity::One => Related::One(matched.into_iter().next().map(Box::new)),
        };
        parent.set_relation(name, related);
    }
    Ok(())
}

/// Attach the relation path to errors that lack one.
fn annotate(err: OrmError, path: &str) -> OrmError {
    match err {
        OrmError::Relation { .. } => err,
        err if err.is_configuration() => OrmError::relation(path, err.to_string()),
        err => err,
    }
}
