//! Init container templates rendered with Tera.
//!
//! Template files may use Go template placeholders (`{{.MasterAddr}}`); they
//! are rewritten to Tera syntax before rendering.

use std::path::Path;

use k8s_openapi::api::core::v1::Container;
use tera::{Context, Tera};
use tracing::info;

use crate::{Error, Result};

pub const DEFAULT_INIT_CONTAINER_IMAGE: &str = "alpine:3.10";
pub const DEFAULT_INIT_CONTAINER_TEMPLATE_FILE: &str = "/etc/config/initContainer.yaml";

const DEFAULT_INIT_CONTAINER_TEMPLATE: &str = r#"- name: init-pytorch
  image: {{.InitContainerImage}}
  imagePullPolicy: IfNotPresent
  resources:
    limits:
      cpu: 100m
      memory: 20Mi
    requests:
      cpu: 50m
      memory: 10Mi
  command: ['sh', '-c', 'err=1;for i in $(seq 100); do if nslookup {{.MasterAddr}}; then err=0 && break; fi;echo waiting for master; sleep 2; done; exit $err']
"#;

/// Convert `{{.value}}` / `{{ .value }}` placeholders to Tera syntax.
pub fn convert_go_to_tera(template: &str) -> String {
    template.replace("{{ .", "{{ ").replace("{{.", "{{")
}

/// Init containers that hold a worker until its master's service resolves.
#[derive(Debug, Clone)]
pub struct InitContainerTemplate {
    image: String,
    template: String,
}

impl InitContainerTemplate {
    /// Parse `template`, failing early if it does not render to containers.
    pub fn new(image: impl Into<String>, template: &str) -> Result<Self> {
        let parsed = Self {
            image: image.into(),
            template: convert_go_to_tera(template),
        };
        parsed.render("master.default.svc")?;
        Ok(parsed)
    }

    /// Read the template at `path`, or use the built-in one when there is no file.
    pub fn load(image: &str, path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No init container template file, using the built-in template");
            return Self::new(image, DEFAULT_INIT_CONTAINER_TEMPLATE);
        }
        let raw = std::fs::read_to_string(path)?;
        Self::new(image, &raw).map_err(|e| {
            Error::Config(format!(
                "init container template {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn render(&self, master_addr: &str) -> Result<Vec<Container>> {
        let mut context = Context::new();
        context.insert("InitContainerImage", &self.image);
        context.insert("MasterAddr", master_addr);
        let rendered = Tera::one_off(&self.template, &context, false)
            .map_err(|e| Error::Internal(format!("Failed to render template: {}", e)))?;
        serde_yaml::from_str(&rendered)
            .map_err(|e| Error::Internal(format!("Template is not a container list: {}", e)))
    }
}

impl Default for InitContainerTemplate {
    fn default() -> Self {
        Self {
            image: DEFAULT_INIT_CONTAINER_IMAGE.to_string(),
            template: convert_go_to_tera(DEFAULT_INIT_CONTAINER_TEMPLATE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_go_to_tera() {
        assert_eq!(convert_go_to_tera("{{.MasterAddr}}"), "{{MasterAddr}}");
        assert_eq!(convert_go_to_tera("{{ .MasterAddr }}"), "{{ MasterAddr }}");
        assert_eq!(convert_go_to_tera("{{ plain }}"), "{{ plain }}");
    }

    #[test]
    fn builtin_template_waits_for_master() {
        let containers = InitContainerTemplate::default()
            .render("resnet-master-0.ml.svc")
            .unwrap();
        assert_eq!(containers.len(), 1);
        let init = &containers[0];
        assert_eq!(init.name, "init-pytorch");
        assert_eq!(init.image.as_deref(), Some(DEFAULT_INIT_CONTAINER_IMAGE));
        let command = init.command.as_ref().unwrap();
        assert!(command[2].contains("nslookup resnet-master-0.ml.svc"));
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let path = std::env::temp_dir().join("training-operator-no-such-template.yaml");
        let template = InitContainerTemplate::load("busybox:1.36", &path).unwrap();
        let containers = template.render("m").unwrap();
        assert_eq!(containers[0].image.as_deref(), Some("busybox:1.36"));
    }

    #[test]
    fn custom_template_file_is_used() {
        let path = std::env::temp_dir().join(format!(
            "training-operator-init-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "- name: wait\n  image: {{ .InitContainerImage }}\n  args: [\"{{ .MasterAddr }}\"]\n",
        )
        .unwrap();
        let template = InitContainerTemplate::load("busybox:1.36", &path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let containers = template.render("resnet-master-0.ml.svc").unwrap();
        assert_eq!(containers[0].name, "wait");
        assert_eq!(
            containers[0].args.as_deref(),
            Some(&["resnet-master-0.ml.svc".to_string()][..])
        );
    }

    #[test]
    fn template_that_is_not_containers_is_rejected() {
        assert!(InitContainerTemplate::new("alpine", "name: {{.MasterAddr}}").is_err());
        assert!(InitContainerTemplate::new("alpine", "- name: {{ missing }}").is_err());
    }
}
