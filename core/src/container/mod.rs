//! Service container
//!
//! Lazily instantiates registered services, caches singletons for the
//! container's lifetime and refuses registrations that would close a
//! dependency cycle.
//!
//! ```rust,ignore
//! const CLOCK: ServiceToken<Arc<Clock>> = ServiceToken::new("clock");
//! const REPORTER: ServiceToken<Arc<Reporter>> = ServiceToken::new("reporter");
//!
//! let container = Container::new();
//! container.register(CLOCK.id(), Registration::new(Factory::constructor(|_| Ok(Arc::new(Clock)))))?;
//! container.register(
//!     REPORTER.id(),
//!     Registration::new(Factory::constructor(|args| Ok(Arc::new(Reporter::new(args.get(0)?)))))
//!         .depends_on(CLOCK.dependency()),
//! )?;
//! let reporter = container.get(&REPORTER).await?;
//! ```

use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// A resolved service value
pub type Instance = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("duplicate registration: service '{0}' is already registered")]
    Duplicate(String),

    #[error("circular dependency: {0}")]
    Circular(String),

    #[error("circular dependency during initialization: {0}")]
    CircularDuringInit(String),

    #[error("service '{service}' depends on unregistered service '{dependency}'")]
    UnregisteredDependency { service: String, dependency: String },

    #[error("service '{0}' is not registered")]
    NotRegistered(String),

    #[error("service '{id}' is not a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("argument {index} is missing or not a {expected}")]
    BadArgument { index: usize, expected: &'static str },

    #[error("factory for '{id}' failed: {source}")]
    Factory {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Typed handle naming a registered service.
///
/// Only carries the identifier; the type parameter lets `Container::get`
/// hand back the concrete value without the caller repeating it.
pub struct ServiceToken<T> {
    id: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ServiceToken<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }

    /// Dependency edge pointing at this service
    pub fn dependency(&self) -> Dependency {
        Dependency::Service(self.id.to_string())
    }
}

impl<T> Clone for ServiceToken<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ServiceToken<T> {}

impl<T> fmt::Debug for ServiceToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceToken({})", self.id)
    }
}

/// One positional input of a factory
#[derive(Clone)]
pub enum Dependency {
    /// Literal value passed through untouched
    Value(Instance),
    /// Another registered service, resolved first
    Service(String),
}

impl Dependency {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(Arc::new(value))
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self::Service(id.into())
    }

    fn service_id(&self) -> Option<&str> {
        match self {
            Self::Service(id) => Some(id),
            Self::Value(_) => None,
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => write!(f, "Value(..)"),
            Self::Service(id) => write!(f, "Service({})", id),
        }
    }
}

/// Resolved dependencies, in declaration order
pub struct Arguments {
    values: Vec<Instance>,
}

impl Arguments {
    /// Downcast the argument at `index`
    pub fn get<T: Any + Clone>(&self, index: usize) -> Result<T, ContainerError> {
        self.values
            .get(index)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or(ContainerError::BadArgument {
                index,
                expected: type_name::<T>(),
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type ConstructFn = Arc<dyn Fn(Arguments) -> Result<Instance, ContainerError> + Send + Sync>;
type CallFn = Arc<dyn Fn(Arguments) -> anyhow::Result<Instance> + Send + Sync>;
type CallAsyncFn = Arc<dyn Fn(Arguments) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

/// How a service gets built
#[derive(Clone)]
pub enum Factory {
    /// Constructor taking the resolved dependencies positionally
    Construct(ConstructFn),
    /// Plain function that may fail
    Call(CallFn),
    /// Asynchronous function that may fail
    CallAsync(CallAsyncFn),
}

impl Factory {
    pub fn constructor<T, F>(build: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        Self::Construct(Arc::new(move |args| Ok(Arc::new(build(args)?) as Instance)))
    }

    pub fn function<T, F>(call: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::Call(Arc::new(move |args| Ok(Arc::new(call(args)?) as Instance)))
    }

    pub fn async_function<T, F, Fut>(call: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::CallAsync(Arc::new(move |args| {
            let fut = call(args);
            Box::pin(async move { Ok(Arc::new(fut.await?) as Instance) })
        }))
    }

    /// Hands out clones of an existing value
    pub fn value<T: Any + Clone + Send + Sync>(value: T) -> Self {
        Self::function(move |_| Ok(value.clone()))
    }

    async fn build(&self, id: &str, args: Arguments) -> Result<Instance, ContainerError> {
        let wrap = |source| ContainerError::Factory {
            id: id.to_string(),
            source,
        };
        match self {
            Self::Construct(build) => build(args),
            Self::Call(call) => call(args).map_err(wrap),
            Self::CallAsync(call) => call(args).await.map_err(wrap),
        }
    }
}

/// Registered service specification
#[derive(Clone)]
pub struct Registration {
    pub factory: Factory,
    pub dependencies: Vec<Dependency>,
    pub singleton: bool,
}

impl Registration {
    pub fn new(factory: Factory) -> Self {
        Self {
            factory,
            dependencies: Vec::new(),
            singleton: true,
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Build a fresh instance on every resolution
    pub fn transient(mut self) -> Self {
        self.singleton = false;
        self
    }

    fn service_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter_map(Dependency::service_id)
    }
}

/// Service locator with lazy instantiation
#[derive(Default)]
pub struct Container {
    registrations: RwLock<HashMap<String, Registration>>,
    instances: Mutex<HashMap<String, Instance>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; fails on duplicates and on cycles
    pub fn register(&self, id: impl Into<String>, registration: Registration) -> Result<(), ContainerError> {
        let id = id.into();
        let mut registrations = self.registrations.write();
        if registrations.contains_key(&id) {
            return Err(ContainerError::Duplicate(id));
        }

        registrations.insert(id.clone(), registration);
        if let Some(cycle) = find_cycle(&registrations, &id) {
            registrations.remove(&id);
            return Err(ContainerError::Circular(cycle.join(" -> ")));
        }

        debug!(service = %id, "registered service");
        Ok(())
    }

    /// Replace a registration and drop its cached instance.
    ///
    /// No cycle check here; resolution catches cycles introduced this way.
    pub fn update(&self, id: &str, registration: Registration) -> Result<(), ContainerError> {
        {
            let mut registrations = self.registrations.write();
            let slot = registrations
                .get_mut(id)
                .ok_or_else(|| ContainerError::NotRegistered(id.to_string()))?;
            *slot = registration;
        }
        self.instances.lock().remove(id);
        debug!(service = %id, "updated service");
        Ok(())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registrations.read().contains_key(id)
    }

    /// Registered service ids, sorted
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registrations.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a service through its typed token
    pub async fn get<T: Any + Clone + Send + Sync>(&self, token: &ServiceToken<T>) -> Result<T, ContainerError> {
        let instance = self.resolve(token.id()).await?;
        instance
            .downcast_ref::<T>()
            .cloned()
            .ok_or(ContainerError::TypeMismatch {
                id: token.id().to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Resolve a service when it is registered, `None` otherwise
    pub async fn get_optional<T: Any + Clone + Send + Sync>(
        &self,
        token: &ServiceToken<T>,
    ) -> Result<Option<T>, ContainerError> {
        if !self.is_registered(token.id()) {
            return Ok(None);
        }
        self.get(token).await.map(Some)
    }

    /// Resolve a service by id without downcasting
    pub async fn resolve(&self, id: &str) -> Result<Instance, ContainerError> {
        self.resolve_with_stack(id.to_string(), Vec::new()).await
    }

    fn resolve_with_stack(&self, id: String, mut stack: Vec<String>) -> BoxFuture<'_, Result<Instance, ContainerError>> {
        Box::pin(async move {
            let cached = self.instances.lock().get(&id).cloned();
            if let Some(instance) = cached {
                return Ok(instance);
            }

            if stack.contains(&id) {
                stack.push(id);
                return Err(ContainerError::CircularDuringInit(stack.join(" -> ")));
            }

            let registration = self
                .registrations
                .read()
                .get(&id)
                .cloned()
                .ok_or_else(|| ContainerError::NotRegistered(id.clone()))?;

            stack.push(id.clone());
            let mut values = Vec::with_capacity(registration.dependencies.len());
            for dependency in &registration.dependencies {
                match dependency {
                    Dependency::Value(value) => values.push(value.clone()),
                    Dependency::Service(dependency_id) => {
                        if !self.is_registered(dependency_id) {
                            return Err(ContainerError::UnregisteredDependency {
                                service: id.clone(),
                                dependency: dependency_id.clone(),
                            });
                        }
                        let value = self
                            .resolve_with_stack(dependency_id.clone(), stack.clone())
                            .await?;
                        values.push(value);
                    }
                }
            }

            let instance = registration.factory.build(&id, Arguments { values }).await?;
            if registration.singleton {
                // A concurrent resolution may have won; the first cached value stays.
                let mut instances = self.instances.lock();
                return Ok(instances.entry(id).or_insert(instance).clone());
            }
            Ok(instance)
        })
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("services", &self.service_ids())
            .field("cached", &self.instances.lock().len())
            .finish()
    }
}

/// Path `start -> ... -> start` through service edges, if one exists
fn find_cycle(registrations: &HashMap<String, Registration>, start: &str) -> Option<Vec<String>> {
    fn visit(
        registrations: &HashMap<String, Registration>,
        current: &str,
        start: &str,
        path: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) -> bool {
        let Some(registration) = registrations.get(current) else {
            return false;
        };
        for dependency in registration.service_dependencies() {
            path.push(dependency.to_string());
            if dependency == start {
                return true;
            }
            if seen.insert(dependency.to_string()) && visit(registrations, dependency, start, path, seen) {
                return true;
            }
            path.pop();
        }
        false
    }

    let mut path = vec![start.to_string()];
    let mut seen = HashSet::new();
    visit(registrations, start, start, &mut path, &mut seen).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Widget {
        label: String,
    }

    const WIDGET: ServiceToken<Arc<Widget>> = ServiceToken::new("widget");

    fn widget(label: &str) -> Registration {
        let label = label.to_string();
        Registration::new(Factory::constructor(move |_| {
            Ok(Arc::new(Widget { label: label.clone() }))
        }))
    }

    fn needs(ids: &[&str]) -> Registration {
        Registration::new(Factory::constructor(|_| Ok(Arc::new(Widget { label: String::new() }))))
            .with_dependencies(ids.iter().map(|id| Dependency::service(*id)).collect())
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let container = Container::new();
        container.register("widget", widget("a")).unwrap();
        let err = container.register("widget", widget("b")).unwrap_err();
        assert!(matches!(err, ContainerError::Duplicate(id) if id == "widget"));
    }

    #[test]
    fn test_three_cycle_rejected_at_closing_edge() {
        let container = Container::new();
        container.register("a", needs(&["b"])).unwrap();
        container.register("b", needs(&["c"])).unwrap();
        let err = container.register("c", needs(&["a"])).unwrap_err();

        match err {
            ContainerError::Circular(cycle) => assert_eq!(cycle, "c -> a -> b -> c"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!container.is_registered("c"));
        assert_eq!(container.service_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let container = Container::new();
        let err = container.register("loop", needs(&["loop"])).unwrap_err();
        assert!(err.to_string().contains("loop -> loop"));
        assert!(!container.is_registered("loop"));
    }

    #[tokio::test]
    async fn test_singleton_returns_same_instance() {
        let container = Container::new();
        container.register(WIDGET.id(), widget("shared")).unwrap();

        let first = container.get(&WIDGET).await.unwrap();
        let second = container.get(&WIDGET).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.label, "shared");
    }

    #[tokio::test]
    async fn test_transient_returns_fresh_instances() {
        let container = Container::new();
        container.register(WIDGET.id(), widget("fresh").transient()).unwrap();

        let first = container.get(&WIDGET).await.unwrap();
        let second = container.get(&WIDGET).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_dependencies_resolved_positionally() {
        const GREETING: ServiceToken<Arc<Widget>> = ServiceToken::new("greeting");

        let container = Container::new();
        container.register("name", widget("world")).unwrap();
        container
            .register(
                GREETING.id(),
                Registration::new(Factory::constructor(|args| {
                    let prefix: String = args.get(0)?;
                    let name: Arc<Widget> = args.get(1)?;
                    Ok(Arc::new(Widget {
                        label: format!("{} {}", prefix, name.label),
                    }))
                }))
                .depends_on(Dependency::value("hello".to_string()))
                .depends_on(Dependency::service("name")),
            )
            .unwrap();

        let greeting = container.get(&GREETING).await.unwrap();
        assert_eq!(greeting.label, "hello world");
    }

    #[tokio::test]
    async fn test_unregistered_dependency_reported() {
        let container = Container::new();
        container.register(WIDGET.id(), needs(&["missing"])).unwrap();

        let err = container.resolve("widget").await.unwrap_err();
        assert!(matches!(
            err,
            ContainerError::UnregisteredDependency { ref service, ref dependency }
                if service == "widget" && dependency == "missing"
        ));
    }

    #[tokio::test]
    async fn test_update_invalidates_cached_singleton() {
        let container = Container::new();
        container.register(WIDGET.id(), widget("old")).unwrap();
        let old = container.get(&WIDGET).await.unwrap();

        container.update(WIDGET.id(), widget("new")).unwrap();
        let new = container.get(&WIDGET).await.unwrap();
        assert_eq!(old.label, "old");
        assert_eq!(new.label, "new");
        assert!(container.update("unknown", widget("x")).is_err());
    }

    #[tokio::test]
    async fn test_cycle_from_update_caught_during_initialization() {
        let container = Container::new();
        container.register("a", needs(&["b"])).unwrap();
        container.register("b", needs(&[])).unwrap();
        container.update("b", needs(&["a"])).unwrap();

        let err = container.resolve("a").await.unwrap_err();
        match err {
            ContainerError::CircularDuringInit(cycle) => assert_eq!(cycle, "a -> b -> a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_async_and_plain_function_factories() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let container = Container::new();
        container
            .register(
                "async",
                Registration::new(Factory::async_function(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(7u32)
                    }
                })),
            )
            .unwrap();
        container
            .register(
                "failing",
                Registration::new(Factory::function(|_| -> anyhow::Result<u32> {
                    anyhow::bail!("no backend")
                })),
            )
            .unwrap();

        let value = container.resolve("async").await.unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&7));
        container.resolve("async").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = container.resolve("failing").await.unwrap_err();
        assert!(err.to_string().contains("no backend"));
    }

    #[tokio::test]
    async fn test_type_mismatch_and_optional_lookup() {
        const WRONG: ServiceToken<Arc<String>> = ServiceToken::new("widget");

        let container = Container::new();
        assert!(container.get_optional(&WIDGET).await.unwrap().is_none());

        container.register(WIDGET.id(), widget("typed")).unwrap();
        assert!(container.get_optional(&WIDGET).await.unwrap().is_some());
        assert!(matches!(
            container.get(&WRONG).await,
            Err(ContainerError::TypeMismatch { .. })
        ));
    }
}
