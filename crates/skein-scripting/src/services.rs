//! Type-keyed services shared with every script.
//!
//! The host fills a [`ServiceRegistry`] before handing it to the
//! [`ScriptSystem`](crate::ScriptSystem); scripts then look services up by
//! type through their [`ScriptContext`](crate::ScriptContext). Everything
//! lives on the simulation thread, so services are reference counted with
//! `Rc` and use interior mutability when scripts need to change them.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

/// A service locator keyed by [`TypeId`].
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use skein_scripting::ServiceRegistry;
///
/// struct Score(Cell<u32>);
///
/// let mut registry = ServiceRegistry::new();
/// registry.insert(Score(Cell::new(0)));
///
/// let score = registry.get::<Score>().unwrap();
/// score.0.set(score.0.get() + 10);
/// assert_eq!(registry.get::<Score>().unwrap().0.get(), 10);
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Rc<dyn Any>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Inserts a service, replacing any previous service of the same type.
    pub fn insert<T: 'static>(&mut self, service: T) {
        self.insert_shared(Rc::new(service));
    }

    /// Inserts a service the host keeps a handle to.
    pub fn insert_shared<T: 'static>(&mut self, service: Rc<T>) {
        self.services.insert(TypeId::of::<T>(), service);
    }

    /// Retrieves a previously registered service.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Clock {
        ticks: u64,
    }

    struct Inventory {
        items: RefCell<Vec<String>>,
    }

    #[test]
    fn test_insert_and_get() {
        let mut registry = ServiceRegistry::new();
        registry.insert(Clock { ticks: 12 });

        let clock = registry.get::<Clock>().unwrap();
        assert_eq!(clock.ticks, 12);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.get::<Clock>().is_none());
        assert!(!registry.contains::<Clock>());
    }

    #[test]
    fn test_shared_service_is_visible_to_host() {
        let inventory = Rc::new(Inventory {
            items: RefCell::new(Vec::new()),
        });
        let mut registry = ServiceRegistry::new();
        registry.insert_shared(inventory.clone());

        registry
            .get::<Inventory>()
            .unwrap()
            .items
            .borrow_mut()
            .push("sword".to_string());

        assert_eq!(*inventory.items.borrow(), vec!["sword".to_string()]);
    }

    #[test]
    fn test_replace_service() {
        let mut registry = ServiceRegistry::new();
        registry.insert(Clock { ticks: 1 });
        registry.insert(Clock { ticks: 2 });

        assert_eq!(registry.get::<Clock>().unwrap().ticks, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(ServiceRegistry::default().is_empty());
    }
}
