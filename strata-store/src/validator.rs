//! Staleness checks for values read from local tiers.

use std::marker::PhantomData;

use async_trait::async_trait;

/// Decides whether a locally held value can be served without a refresh.
#[async_trait]
pub trait Validator<V>: Send + Sync {
    async fn is_valid(&self, value: &V) -> bool;
}

/// Validator backed by a synchronous predicate.
pub struct FnValidator<F, V> {
    check: F,
    _marker: PhantomData<fn(&V)>,
}

pub fn validator_fn<V, F>(check: F) -> FnValidator<F, V>
where
    F: Fn(&V) -> bool + Send + Sync,
{
    FnValidator {
        check,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<V, F> Validator<V> for FnValidator<F, V>
where
    F: Fn(&V) -> bool + Send + Sync,
    V: Sync,
{
    async fn is_valid(&self, value: &V) -> bool {
        (self.check)(value)
    }
}
