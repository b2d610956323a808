pub mod deploys;
pub mod distribution;
pub mod hosts;
pub mod profiles;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod test_support;
