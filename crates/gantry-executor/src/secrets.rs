//! Secret resolution and injection.

use std::collections::HashMap;

use tracing::debug;

use gantry_client::ControlPlane;
use gantry_core::{Container, Error, Pipeline, Result, Secret};

/// Resolve every secret the pipeline declares against the secret store.
/// Runs once at build start; the resulting map is read-only afterwards.
pub(crate) async fn populate(
    client: &dyn ControlPlane,
    pipeline: &Pipeline,
) -> Result<HashMap<String, Secret>> {
    let mut secrets = HashMap::with_capacity(pipeline.secrets.len());
    for spec in &pipeline.secrets {
        let mut secret = client.get_secret(&spec.engine, &spec.key).await?;
        secret.name = spec.name.clone();
        debug!(secret = %spec.name, engine = %spec.engine, "resolved secret");
        secrets.insert(spec.name.clone(), secret);
    }
    Ok(secrets)
}

/// Inject the container's requested secrets into its environment.
/// Injection happens before substitution so secret values participate in
/// the substitution namespace.
pub(crate) fn inject(container: &mut Container, secrets: &HashMap<String, Secret>) -> Result<()> {
    for reference in container.secrets.clone() {
        let secret = secrets.get(&reference.source).ok_or_else(|| {
            Error::NotFound(format!(
                "container {} references unknown secret {}",
                container.name, reference.source
            ))
        })?;
        secret.allow_container(&container.name)?;
        container
            .environment
            .insert(reference.target.clone(), secret.value.clone());
    }
    Ok(())
}
