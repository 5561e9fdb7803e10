use crate::activity::{Activity, StopState};
use crate::error::Error;
use crate::events::SubscribeOptions;
use crate::lock;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// An [`Activity`] that supervises an ordered list of child activities.
///
/// Stopping the manager stops its children first, last added first. A child
/// belongs to at most one manager at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityManager {
    activity: Activity,
}

impl Deref for ActivityManager {
    type Target = Activity;

    fn deref(&self) -> &Activity {
        &self.activity
    }
}

impl Default for ActivityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityManager {
    pub fn new() -> Self {
        Self::labelled("manager", false)
    }

    pub fn restartable() -> Self {
        Self::labelled("manager", true)
    }

    pub fn labelled(label: impl Into<String>, allow_restart: bool) -> Self {
        Self {
            activity: Activity::build(label, allow_restart, true),
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    fn children_list(&self) -> &Mutex<Vec<Activity>> {
        self.activity
            .inner
            .children
            .as_ref()
            .unwrap_or_else(|| unreachable!("managers are always built with a child list"))
    }

    /// Add `activity` as the most recent child.
    ///
    /// A no-op when it is already a child. Managing this manager or one of its
    /// ancestors fails with [`Error::SelfManagement`]; taking a child that
    /// another manager still holds fails with [`Error::AlreadyManaged`].
    pub fn add(&self, activity: &Activity) -> Result<(), Error> {
        if self.is_descendant_of(activity) {
            return Err(Error::SelfManagement {
                activity: activity.id(),
            });
        }

        let mut owner = lock(&activity.inner.owner);
        if let Some(current) = owner.upgrade() {
            let current = ActivityManager {
                activity: Activity { inner: current },
            };
            if current == *self {
                return Ok(());
            }
            if current.contains(activity) {
                return Err(Error::AlreadyManaged {
                    activity: activity.id(),
                    manager: current.id(),
                });
            }
        }
        *owner = Arc::downgrade(&self.activity.inner);

        let mut children = lock(self.children_list());
        if !children.iter().any(|child| child.ptr_eq(activity)) {
            children.push(activity.clone());
        }
        Ok(())
    }

    /// Remove `activity` from the children, reporting whether it was present.
    pub fn remove(&self, activity: &Activity) -> bool {
        let removed = {
            let mut children = lock(self.children_list());
            match children.iter().position(|child| child.ptr_eq(activity)) {
                Some(index) => {
                    children.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            activity.release_owner(&self.activity);
        }
        removed
    }

    pub fn contains(&self, activity: &Activity) -> bool {
        lock(self.children_list())
            .iter()
            .any(|child| child.ptr_eq(activity))
    }

    /// Snapshot of the children in insertion order.
    pub fn children(&self) -> Vec<Activity> {
        lock(self.children_list()).clone()
    }

    /// Supervise `activity`: it is removed from the children as soon as it
    /// emits its first stop event.
    pub fn manage(&self, activity: &Activity) -> Result<(), Error> {
        self.manage_with(activity, || {})
    }

    /// Like [`manage`](Self::manage), running `on_stop` before the removal.
    ///
    /// `on_stop` runs exactly once. When `activity` is already stopped and
    /// cannot restart it is not added and `on_stop` runs immediately.
    pub fn manage_with<F>(&self, activity: &Activity, on_stop: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if activity.is_stopped() {
            if self.is_descendant_of(activity) {
                return Err(Error::SelfManagement {
                    activity: activity.id(),
                });
            }
            on_stop();
            return Ok(());
        }

        self.add(activity)?;
        trace!(manager = self.id(), activity = activity.id(), "managing activity");

        let manager = Arc::downgrade(&self.activity.inner);
        let on_stop = Mutex::new(Some(on_stop));
        activity.stop_states().subscribe(
            move |state: &StopState| {
                if let Some(on_stop) = lock(&on_stop).take() {
                    on_stop();
                }
                if let Some(inner) = manager.upgrade() {
                    let manager = ActivityManager {
                        activity: Activity { inner },
                    };
                    manager.remove(&state.activity);
                }
            },
            SubscribeOptions::once(),
        )?;
        Ok(())
    }

    /// True when `activity` is this manager or one of its current owners.
    fn is_descendant_of(&self, activity: &Activity) -> bool {
        let mut current = Some(self.activity.clone());
        while let Some(node) = current {
            if node.ptr_eq(activity) {
                return true;
            }
            current = node.owner();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::StopState;
    use pretty_assertions::assert_eq;

    fn log_stops(activity: &Activity, name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) {
        let log = log.clone();
        activity
            .stop_states()
            .subscribe(
                move |_: &StopState| log.lock().unwrap().push(name),
                SubscribeOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn stops_children_lifo_then_self() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ActivityManager::new();
        let a = ActivityManager::new();
        let a_child = Activity::new();
        let b = Activity::new();
        let c = Activity::new();
        a.add(&a_child).unwrap();
        for (activity, name) in [(a.activity(), "A"), (&b, "B"), (&c, "C")] {
            manager.add(activity).unwrap();
            log_stops(activity, name, &log);
        }
        log_stops(&a_child, "A.child", &log);
        log_stops(&manager, "manager", &log);

        manager.stop();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["C", "B", "A.child", "A", "manager"]
        );
        assert!(manager.children().is_empty());
        assert!(a_child.is_stopped());
    }

    #[test]
    fn add_is_idempotent_and_remove_reports_presence() {
        let manager = ActivityManager::new();
        let child = Activity::new();
        manager.add(&child).unwrap();
        manager.add(&child).unwrap();
        assert_eq!(manager.children().len(), 1);
        assert!(manager.remove(&child));
        assert!(!manager.remove(&child));
    }

    #[test]
    fn managing_self_or_ancestor_is_rejected() {
        let root = ActivityManager::new();
        let inner = ActivityManager::new();
        root.add(&inner).unwrap();
        assert_eq!(
            root.add(&root).unwrap_err(),
            Error::SelfManagement { activity: root.id() }
        );
        assert_eq!(
            inner.add(&root).unwrap_err(),
            Error::SelfManagement { activity: root.id() }
        );
    }

    #[test]
    fn child_cannot_be_shared_between_managers() {
        let first = ActivityManager::new();
        let second = ActivityManager::new();
        let child = Activity::new();
        first.add(&child).unwrap();
        assert_eq!(
            second.add(&child).unwrap_err(),
            Error::AlreadyManaged {
                activity: child.id(),
                manager: first.id(),
            }
        );
        first.remove(&child);
        second.add(&child).unwrap();
    }

    #[test]
    fn managed_child_detaches_on_first_stop() {
        let manager = ActivityManager::new();
        let child = Activity::restartable();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        manager
            .manage_with(&child, move || *c.lock().unwrap() += 1)
            .unwrap();
        assert_eq!(manager.children(), vec![child.clone()]);

        child.stop();
        child.stop();
        manager.stop();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(manager.children().is_empty());
        assert!(child.owner().is_none());
    }

    #[test]
    fn manager_stop_runs_on_stop_for_managed_children() {
        let manager = ActivityManager::restartable();
        let child = Activity::new();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        manager
            .manage_with(&child, move || *c.lock().unwrap() += 1)
            .unwrap();
        manager.stop();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(child.is_stopped());
        assert!(!manager.is_stopped());
    }

    #[test]
    fn managing_stopped_activity_runs_cleanup_immediately() {
        let manager = ActivityManager::new();
        let child = Activity::new();
        child.stop();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        manager
            .manage_with(&child, move || *c.lock().unwrap() += 1)
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(manager.children().is_empty());
    }

    #[test]
    fn panicking_child_does_not_abort_cascade() {
        let manager = ActivityManager::new();
        let first = Activity::new();
        let faulty = Activity::new();
        manager.add(&first).unwrap();
        manager.add(&faulty).unwrap();
        faulty
            .stop_states()
            .subscribe(|_: &StopState| panic!("observer failure"), SubscribeOptions::once())
            .unwrap();

        manager.stop();

        assert!(faulty.is_stopped());
        assert!(first.is_stopped());
        assert!(manager.is_stopped());
    }

    #[test]
    fn restartable_manager_accepts_children_after_panicking_observer() {
        let manager = ActivityManager::labelled("evaluator", true);
        let first = Activity::new();
        manager.add(&first).unwrap();
        manager
            .stop_states()
            .subscribe(|_: &StopState| panic!("observer failure"), SubscribeOptions::once())
            .unwrap();

        assert!(manager.stop_best_effort());
        assert!(first.is_stopped());
        assert!(!manager.is_stopped());

        let second = Activity::new();
        manager.add(&second).unwrap();
        assert_eq!(manager.children().len(), 1);
    }

    #[test]
    fn tree_snapshot_does_not_mutate() {
        let manager = ActivityManager::labelled("evaluator", true);
        let cell = ActivityManager::labelled("cell", false);
        manager.add(&cell).unwrap();
        cell.add(&Activity::labelled("timer", false)).unwrap();
        let tree = manager.tree();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].children[0].label, "timer");
        assert_eq!(manager.tree(), tree);
        assert!(!cell.is_stopped());
    }
}
