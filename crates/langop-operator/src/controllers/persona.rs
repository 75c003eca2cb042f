//! LanguagePersona controller
//!
//! A persona has no workload. Reconciling it validates the profile and
//! publishes it as a ConfigMap agents can mount.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;

use langop_common::crd::{LanguagePersona, LanguagePersonaSpec};
use langop_common::kube_utils::{child_name, common_labels};
use langop_common::Error;

use super::REASON_INVALID_SPEC;
use crate::client::ResourceKind;
use crate::context::Context;
use crate::reconciler::{Pass, Reconcilable};
use crate::sync::ChildKind;
use crate::workload::config_map;

const CONFIG_SUFFIX: &str = "persona";

fn config_data(spec: &LanguagePersonaSpec) -> Result<BTreeMap<String, String>, Error> {
    let mut data = BTreeMap::from([
        ("persona.json".to_string(), serde_json::to_string(spec)?),
        ("displayName".to_string(), spec.display_name.clone()),
        ("systemPrompt".to_string(), spec.system_prompt.clone()),
    ]);
    if let Some(tone) = &spec.tone {
        data.insert("tone".to_string(), tone.clone());
    }
    if let Some(language) = &spec.language {
        data.insert("language".to_string(), language.clone());
    }
    Ok(data)
}

#[async_trait]
impl Reconcilable for LanguagePersona {
    const KIND: ResourceKind = ResourceKind::Persona;

    fn config_artifacts(&self) -> Vec<(ChildKind, String)> {
        vec![(ChildKind::ConfigMap, child_name(&self.name_any(), CONFIG_SUFFIX))]
    }

    fn ready_message(&self) -> String {
        format!("Persona {} is available", self.spec.display_name)
    }

    async fn synchronize(&self, ctx: &Context, pass: &mut Pass) -> Result<(), Error> {
        let name = self.name_any();
        self.spec
            .validate()
            .map_err(|msg| Error::configuration_for(&name, REASON_INVALID_SPEC, msg))?;

        let child = config_map(
            &child_name(&name, CONFIG_SUFFIX),
            pass.namespace(),
            common_labels(&name, ResourceKind::Persona.as_str()),
            config_data(&self.spec)?,
        );
        pass.sync(ctx, child).await?;
        Ok(())
    }
}
