//! Observable Values
//!
//! Reactive values using `tokio::sync::watch` for multi-subscriber
//! notifications. Every value the host supervisor can see (shade position,
//! travel time, serial link status) is an `Observable`.
//!
//! # Example
//!
//! ```rust,ignore
//! let travel = Observable::new("travel_time", 8.0)
//!     .with_units("s")
//!     .with_range(0.0, 60.0);
//!
//! // Subscribe to changes
//! let mut rx = travel.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("Travel time changed to: {}", *rx.borrow());
//!     }
//! });
//!
//! // Update value (notifies all subscribers)
//! travel.set(12.5)?;
//! ```

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Validator callback type.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Shared state for Observable that propagates to all clones.
///
/// Uses `parking_lot::RwLock` (not tokio) because metadata access is fast and
/// must be available from synchronous code.
struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

/// Metadata for an observable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Value name (unique within a node), e.g. `"ST"` or `"GV1"`.
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Physical units (e.g., "%", "s").
    pub units: Option<String>,

    /// Whether this value rejects `set()` calls from outside the crate.
    pub read_only: bool,

    /// Minimum accepted value for numeric constraints.
    #[serde(default)]
    pub min_value: Option<f64>,

    /// Maximum accepted value for numeric constraints.
    #[serde(default)]
    pub max_value: Option<f64>,
}

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Shared metadata and validator
    shared: Arc<RwLock<ObservableSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                    min_value: None,
                    max_value: None,
                },
                validator: None,
            })),
        }
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Mark this observable as read-only.
    ///
    /// The owning component still updates it through `set_unchecked`.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the value name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Validate a value without setting it.
    ///
    /// Returns error if the value is read-only or validation fails.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(anyhow!("Parameter '{}' is read-only", guard.metadata.name));
        }

        if let Some(validator) = &guard.validator {
            validator(value)?;
        }

        Ok(())
    }

    /// Set a new value, notifying all subscribers.
    pub fn set(&self, value: T) -> Result<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set value without validation (owner use).
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Re-announce the current value to every subscriber, even if unchanged.
    pub fn report(&self) {
        self.sender.send_modify(|_| {});
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + Into<f64> + 'static,
{
    /// Constrain the value to `[min, max]` (inclusive) and record the bounds
    /// in the metadata.
    pub fn with_range(self, min: T, max: T) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = Some(min.clone().into());
            guard.metadata.max_value = Some(max.clone().into());
        }
        self.with_validator(move |value| {
            if *value < min || *value > max {
                Err(anyhow!(
                    "Value {:?} out of range [{:?}, {:?}]",
                    value,
                    min,
                    max
                ))
            } else {
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        let travel = Observable::new("GV1", 8.0).with_range(0.0, 60.0);

        assert!(travel.set(15.0).is_ok());
        assert_eq!(travel.get(), 15.0);

        assert!(travel.set(70.0).is_err());
        assert_eq!(travel.get(), 15.0);
    }

    #[test]
    fn test_read_only_rejects_set_but_owner_can_update() {
        let link = Observable::new("GV1", false).read_only();
        assert!(link.set(true).is_err());

        link.set_unchecked(true);
        assert!(link.get());
    }

    #[tokio::test]
    async fn test_report_notifies_unchanged_value() {
        let position: Observable<Option<u8>> = Observable::new("ST", Some(40));
        let mut rx = position.subscribe();
        rx.borrow_and_update();

        position.report();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(40));
    }

    #[test]
    fn test_clones_share_value() {
        let a = Observable::new("ST", 1u8);
        let b = a.clone();
        a.set(2).unwrap();
        assert_eq!(b.get(), 2);
        assert_eq!(b.name(), "ST");
    }
}
