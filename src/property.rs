//! Host-owned property cells and the registry the runtime resolves them
//! through.
//!
//! The runtime never holds a strong reference to anything the host owns.
//! Properties live in a [`PropertyRegistry`] the *host* owns and passes into
//! [`update`]/[`apply`] by reference; the runtime keeps only generation-
//! checked [`PropertyHandle`]s. Destroying a property invalidates its slot's
//! generation, so every handle the runtime still holds simply starts reading
//! as dead — that is the weak-reference semantics the composition chains and
//! the incremental cleanup probe rely on.
//!
//! [`update`]: crate::manager::AnimationManager::update
//! [`apply`]: crate::manager::AnimationManager::apply

use core::any::TypeId;
use core::fmt;
use core::hash::Hasher;
use core::marker::PhantomData;

use downcast_rs::{Downcast, impl_downcast};
use fnv::{FnvHashMap, FnvHasher};
use slotmap::{Key, SlotMap, new_key_type};
use tracing::warn;

use crate::TargetId;
use crate::animatable::Animatable;

new_key_type! {
    /// Generation-checked key of a property slot inside a registry.
    pub struct PropertyKey;
}

/// A host cell the runtime can write animation values into.
///
/// Implementations must not block: `set_animated_value` is invoked during
/// [`apply`] from a single thread (or during [`update`] for immediate
/// properties), and the read-side accessors may be called from several
/// worker threads at once.
///
/// [`update`]: crate::manager::AnimationManager::update
/// [`apply`]: crate::manager::AnimationManager::apply
pub trait AnimatableProperty<T: Animatable>: Downcast + Send + Sync {
    /// The property's value in the absence of animations, if it has one.
    /// Properties without a base value compose starting from
    /// [`Animatable::identity`].
    fn base_value(&self) -> Option<T>;

    /// Writes the blended animation value.
    fn set_animated_value(&mut self, value: T);

    /// Mirror flag maintained by the composition chain. Hosts may read the
    /// flag but must not write it while animations are active.
    fn set_is_animated(&mut self, animated: bool);

    /// Immediate properties are written during `update` rather than `apply`,
    /// ahead of every ordinary property in the same frame. Animation weights
    /// are the canonical immediate property.
    fn is_immediate(&self) -> bool {
        false
    }

    /// The value currently visible on the property: the last applied
    /// animation value while animated, otherwise the base value. Weight
    /// sources are read through this.
    fn current_value(&self) -> Option<T> {
        self.base_value()
    }
}
impl_downcast!(AnimatableProperty<T> where T: Animatable);

/// A minimal value-cell property, sufficient for hosts that just want a
/// place for the runtime to write into.
#[derive(Clone, Debug)]
pub struct SimpleProperty<T: Animatable> {
    base: T,
    animated: Option<T>,
    is_animated: bool,
    immediate: bool,
}

impl<T: Animatable> SimpleProperty<T> {
    /// An ordinary property with the given base value.
    pub fn new(base: T) -> Self {
        Self {
            base,
            animated: None,
            is_animated: false,
            immediate: false,
        }
    }

    /// An immediate property, applied during `update` (use for animation
    /// weights and other values that other animations read within the same
    /// frame).
    pub fn immediate(base: T) -> Self {
        Self {
            immediate: true,
            ..Self::new(base)
        }
    }

    /// The visible value: the animation value while animated, the base value
    /// otherwise.
    pub fn value(&self) -> &T {
        match &self.animated {
            Some(v) if self.is_animated => v,
            _ => &self.base,
        }
    }

    /// Whether a composition chain currently drives this property.
    pub fn is_animated(&self) -> bool {
        self.is_animated
    }

    /// Replaces the base value.
    pub fn set_base_value(&mut self, base: T) {
        self.base = base;
    }
}

impl<T: Animatable> AnimatableProperty<T> for SimpleProperty<T> {
    fn base_value(&self) -> Option<T> {
        Some(self.base.clone())
    }

    fn set_animated_value(&mut self, value: T) {
        self.animated = Some(value);
    }

    fn set_is_animated(&mut self, animated: bool) {
        self.is_animated = animated;
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }

    fn current_value(&self) -> Option<T> {
        Some(self.value().clone())
    }
}

/// Typed weak handle to a registered property.
///
/// Handles stay `Copy` and cheap; they do not keep the property alive. A
/// handle whose property has been destroyed resolves to `None` everywhere.
pub struct PropertyHandle<T> {
    pub(crate) key: PropertyKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PropertyHandle<T> {
    fn new(key: PropertyKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }
}

impl<T: Animatable> PropertyHandle<T> {
    /// Erases the value type, for APIs that deal with mixed-type properties.
    pub fn erase(self) -> ErasedHandle {
        ErasedHandle {
            type_id: TypeId::of::<T>(),
            key: self.key,
        }
    }
}

impl<T> Clone for PropertyHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PropertyHandle<T> {}
impl<T> PartialEq for PropertyHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl<T> Eq for PropertyHandle<T> {}
impl<T> fmt::Debug for PropertyHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyHandle").field(&self.key).finish()
    }
}

/// A [`PropertyHandle`] with the value type erased. This is the identity
/// composition chains and the chain collection are keyed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErasedHandle {
    pub(crate) type_id: TypeId,
    pub(crate) key: PropertyKey,
}

impl ErasedHandle {
    /// Recovers the typed handle, if `T` matches the registered value type.
    pub fn typed<T: Animatable>(self) -> Option<PropertyHandle<T>> {
        (self.type_id == TypeId::of::<T>()).then(|| PropertyHandle::new(self.key))
    }
}

impl<T: Animatable> From<PropertyHandle<T>> for ErasedHandle {
    fn from(handle: PropertyHandle<T>) -> Self {
        handle.erase()
    }
}

struct PropertyEntry<T: Animatable> {
    property: Box<dyn AnimatableProperty<T>>,
    target: Option<TargetId>,
    hash: u64,
}

struct TypedStore<T: Animatable> {
    slots: SlotMap<PropertyKey, PropertyEntry<T>>,
}

impl<T: Animatable> Default for TypedStore<T> {
    fn default() -> Self {
        Self {
            slots: SlotMap::with_key(),
        }
    }
}

trait AnyStore: Downcast + Send + Sync {
    fn contains(&self, key: PropertyKey) -> bool;
    fn hash_of(&self, key: PropertyKey) -> Option<u64>;
    /// Removes the slot, returning its name registration (if any) so the
    /// caller can drop the index entry.
    fn destroy(&mut self, key: PropertyKey) -> Option<Option<TargetId>>;
}
impl_downcast!(AnyStore);

impl<T: Animatable> AnyStore for TypedStore<T> {
    fn contains(&self, key: PropertyKey) -> bool {
        self.slots.contains_key(key)
    }

    fn hash_of(&self, key: PropertyKey) -> Option<u64> {
        self.slots.get(key).map(|entry| entry.hash)
    }

    fn destroy(&mut self, key: PropertyKey) -> Option<Option<TargetId>> {
        self.slots.remove(key).map(|entry| entry.target)
    }
}

/// The host-owned index of animatable properties, grouped by value type.
///
/// Hosts register their property cells here and pass the registry into the
/// manager's frame loop. Removing a property (or dropping it via
/// [`destroy`](Self::destroy)) retires its slot generation; the runtime
/// notices within a bounded number of frames and prunes the animations that
/// targeted it.
#[derive(Default)]
pub struct PropertyRegistry {
    stores: FnvHashMap<TypeId, Box<dyn AnyStore>>,
    names: FnvHashMap<TargetId, ErasedHandle>,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn store<T: Animatable>(&self) -> Option<&TypedStore<T>> {
        self.stores
            .get(&TypeId::of::<T>())
            .and_then(|store| store.downcast_ref::<TypedStore<T>>())
    }

    fn store_mut<T: Animatable>(&mut self) -> &mut TypedStore<T> {
        self.stores
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(TypedStore::<T>::default()))
            .downcast_mut::<TypedStore<T>>()
            .expect("property store registered under a foreign type id")
    }

    /// Registers an anonymous property and returns its handle.
    pub fn register<T: Animatable>(
        &mut self,
        property: impl AnimatableProperty<T>,
    ) -> PropertyHandle<T> {
        self.insert(None, Box::new(property))
    }

    /// Registers a property under a [`TargetId`] so timelines can bind to it
    /// by name. Re-registering a name replaces the previous binding.
    pub fn register_named<T: Animatable>(
        &mut self,
        target: TargetId,
        property: impl AnimatableProperty<T>,
    ) -> PropertyHandle<T> {
        let handle = self.insert(Some(target), Box::new(property));
        if let Some(previous) = self.names.insert(target, handle.erase()) {
            warn!(?target, "property name re-registered; dropping the previous binding");
            if let Some(store) = self.stores.get_mut(&previous.type_id) {
                store.destroy(previous.key);
            }
        }
        handle
    }

    fn insert<T: Animatable>(
        &mut self,
        target: Option<TargetId>,
        property: Box<dyn AnimatableProperty<T>>,
    ) -> PropertyHandle<T> {
        let store = self.store_mut::<T>();
        let key = store.slots.insert_with_key(|key| PropertyEntry {
            property,
            target,
            hash: match target {
                Some(target) => target.stable_hash(),
                None => hash_key(key),
            },
        });
        PropertyHandle::new(key)
    }

    /// Removes a property, returning the boxed cell to the host. Every
    /// handle to the slot is dead afterwards.
    pub fn remove<T: Animatable>(
        &mut self,
        handle: PropertyHandle<T>,
    ) -> Option<Box<dyn AnimatableProperty<T>>> {
        let entry = self.store_mut::<T>().slots.remove(handle.key)?;
        if let Some(target) = entry.target {
            self.names.remove(&target);
        }
        Some(entry.property)
    }

    /// Type-erased removal. Returns whether a property was removed.
    pub fn destroy(&mut self, handle: ErasedHandle) -> bool {
        let Some(store) = self.stores.get_mut(&handle.type_id) else {
            return false;
        };
        match store.destroy(handle.key) {
            Some(target) => {
                if let Some(target) = target {
                    self.names.remove(&target);
                }
                true
            }
            None => false,
        }
    }

    /// Resolves a handle to the property cell, if it is still alive.
    pub fn get<T: Animatable>(&self, handle: PropertyHandle<T>) -> Option<&dyn AnimatableProperty<T>> {
        self.store::<T>()?
            .slots
            .get(handle.key)
            .map(|entry| entry.property.as_ref())
    }

    /// Mutable access to the property cell, if it is still alive.
    pub fn get_mut<T: Animatable>(
        &mut self,
        handle: PropertyHandle<T>,
    ) -> Option<&mut dyn AnimatableProperty<T>> {
        self.stores
            .get_mut(&TypeId::of::<T>())?
            .downcast_mut::<TypedStore<T>>()?
            .slots
            .get_mut(handle.key)
            .map(|entry| entry.property.as_mut())
    }

    /// Looks up a named property with its expected value type.
    pub fn resolve<T: Animatable>(&self, target: TargetId) -> Option<PropertyHandle<T>> {
        self.resolve_erased(target)?.typed()
    }

    /// Looks up a named property without committing to a value type.
    pub fn resolve_erased(&self, target: TargetId) -> Option<ErasedHandle> {
        let handle = *self.names.get(&target)?;
        self.contains(handle).then_some(handle)
    }

    /// Liveness check for an erased handle.
    pub fn contains(&self, handle: ErasedHandle) -> bool {
        self.stores
            .get(&handle.type_id)
            .is_some_and(|store| store.contains(handle.key))
    }

    /// The stable ordering hash of a live property.
    pub(crate) fn hash_erased(&self, handle: ErasedHandle) -> Option<u64> {
        self.stores.get(&handle.type_id)?.hash_of(handle.key)
    }

    /// Chain-creation metadata for a live property: `(ordering hash,
    /// is_immediate)`.
    pub(crate) fn chain_meta<T: Animatable>(
        &self,
        handle: PropertyHandle<T>,
    ) -> Option<(u64, bool)> {
        let entry = self.store::<T>()?.slots.get(handle.key)?;
        Some((entry.hash, entry.property.is_immediate()))
    }

    /// Reads the currently visible value of a property. This is how weight
    /// sources observe immediate chains within the frame that wrote them.
    pub(crate) fn current_value<T: Animatable>(&self, handle: PropertyHandle<T>) -> Option<T> {
        self.get(handle)?.current_value()
    }
}

fn hash_key(key: PropertyKey) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write_u64(key.data().as_ffi());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TargetId;

    #[test]
    fn register_and_read_back() {
        let mut registry = PropertyRegistry::new();
        let handle = registry.register(SimpleProperty::new(2.0f32));

        registry.get_mut(handle).unwrap().set_animated_value(5.0);
        registry.get_mut(handle).unwrap().set_is_animated(true);

        let cell = registry
            .get(handle)
            .unwrap()
            .downcast_ref::<SimpleProperty<f32>>()
            .unwrap();
        assert_eq!(*cell.value(), 5.0);
        assert_eq!(registry.current_value(handle), Some(5.0));
    }

    #[test]
    fn handles_die_on_removal() {
        let mut registry = PropertyRegistry::new();
        let handle = registry.register(SimpleProperty::new(0.0f32));
        let erased = handle.erase();

        assert!(registry.contains(erased));
        assert!(registry.remove(handle).is_some());
        assert!(!registry.contains(erased));
        assert!(registry.get(handle).is_none());

        // A fresh registration must not resurrect the old handle.
        let _other = registry.register(SimpleProperty::new(1.0f32));
        assert!(registry.get(handle).is_none());
    }

    #[test]
    fn named_resolution_is_typed() {
        let mut registry = PropertyRegistry::new();
        let target = TargetId::from_names(["ball", "radius"]);
        let handle = registry.register_named(target, SimpleProperty::new(1.0f32));

        assert_eq!(registry.resolve::<f32>(target), Some(handle));
        assert!(registry.resolve::<f64>(target).is_none());

        registry.remove(handle);
        assert!(registry.resolve_erased(target).is_none());
    }

    #[test]
    fn named_hash_follows_the_target_id() {
        let mut registry = PropertyRegistry::new();
        let target = TargetId::from_name("opacity");
        let handle = registry.register_named(target, SimpleProperty::new(0.0f32));
        assert_eq!(registry.hash_erased(handle.erase()), Some(target.stable_hash()));
    }

    #[test]
    fn erased_handle_rejects_foreign_types() {
        let mut registry = PropertyRegistry::new();
        let handle = registry.register(SimpleProperty::new(0.0f32));
        let erased = handle.erase();
        assert!(erased.typed::<f32>().is_some());
        assert!(erased.typed::<f64>().is_none());
    }

    #[test]
    fn immediate_flag_flows_into_chain_metadata() {
        let mut registry = PropertyRegistry::new();
        let weight = registry.register(SimpleProperty::immediate(1.0f32));
        let plain = registry.register(SimpleProperty::new(1.0f32));
        assert_eq!(registry.chain_meta(weight).map(|(_, i)| i), Some(true));
        assert_eq!(registry.chain_meta(plain).map(|(_, i)| i), Some(false));
    }
}
