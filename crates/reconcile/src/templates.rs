//! Desired shapes of every object the operator owns. Pure functions of the
//! [`DesiredState`]; nothing here talks to the platform.

use std::collections::BTreeMap;

use butler_core::{labels, DesiredState, Payload, Route, RouteSpec};
use butler_core::crd::{RoutePort, RouteTarget, RouteTls};
use butler_core::state::ServiceTarget;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, HTTPGetAction, Pod, PodSpec, PodTemplateSpec, Probe, Secret,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;

pub const MASTER_CONTAINER: &str = "jenkins-master";
pub const DEFAULT_IMAGE: &str = "jenkins/jenkins:lts";
pub const JENKINS_HOME: &str = "/var/jenkins/home";
pub const SCRIPTS_PATH: &str = "/var/jenkins/scripts";
pub const INIT_CONFIGURATION_PATH: &str = "/var/jenkins/init-configuration";
pub const CREDENTIALS_PATH: &str = "/var/jenkins/operator-credentials";
const DEFAULT_EXECUTORS: u32 = 1;

/// Metadata shared by every owned object.
pub fn meta(desired: &DesiredState, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(desired.namespace.clone()),
        labels: Some(desired.labels.clone()),
        owner_references: desired.owner_references(),
        ..Default::default()
    }
}

pub fn credentials_secret(desired: &DesiredState) -> Secret {
    let password = uuid::Uuid::new_v4().simple().to_string();
    Secret {
        metadata: meta(desired, labels::credentials_secret_name(&desired.name)),
        data: Some(BTreeMap::from([
            (labels::CREDENTIALS_USER_KEY.to_string(), ByteString(labels::OPERATOR_USER_NAME.as_bytes().to_vec())),
            (labels::CREDENTIALS_PASSWORD_KEY.to_string(), ByteString(password.into_bytes())),
        ])),
        ..Default::default()
    }
}

fn config_map(desired: &DesiredState, name: String, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap { metadata: meta(desired, name), data: Some(data), ..Default::default() }
}

/// Entry point of the master container: installs the desired plugins, then starts Jenkins.
pub fn scripts_config_map(desired: &DesiredState) -> ConfigMap {
    let plugins: Vec<String> = desired.plugins.iter().map(ToString::to_string).collect();
    let init = format!(
        "#!/usr/bin/env bash\n\
         set -e\n\
         mkdir -p {home}/init.groovy.d\n\
         cp -n {init}/*.groovy {home}/init.groovy.d/ || true\n\
         jenkins-plugin-cli --verbose --plugins {plugins}\n\
         exec /usr/bin/tini -- /usr/local/bin/jenkins.sh\n",
        home = JENKINS_HOME,
        init = INIT_CONFIGURATION_PATH,
        plugins = plugins.join(" "),
    );
    config_map(desired, labels::scripts_config_map_name(&desired.name), BTreeMap::from([("init.sh".to_string(), init)]))
}

/// Creates the operator user from the mounted credentials on first boot.
pub fn init_configuration_config_map(desired: &DesiredState) -> ConfigMap {
    let script = format!(
        "import hudson.security.*\n\
         import jenkins.model.*\n\n\
         def jenkins = Jenkins.getInstance()\n\
         def user = new File('{path}/{user}').text.trim()\n\
         def password = new File('{path}/{password}').text.trim()\n\n\
         def realm = new HudsonPrivateSecurityRealm(false)\n\
         realm.createAccount(user, password)\n\
         jenkins.setSecurityRealm(realm)\n\
         def strategy = new FullControlOnceLoggedInAuthorizationStrategy()\n\
         strategy.setAllowAnonymousRead(false)\n\
         jenkins.setAuthorizationStrategy(strategy)\n\
         jenkins.save()\n",
        path = CREDENTIALS_PATH,
        user = labels::CREDENTIALS_USER_KEY,
        password = labels::CREDENTIALS_PASSWORD_KEY,
    );
    config_map(
        desired,
        labels::init_configuration_config_map_name(&desired.name),
        BTreeMap::from([("createOperatorUser.groovy".to_string(), script)]),
    )
}

pub fn http_service_fqdn(desired: &DesiredState, cluster_domain: &str) -> String {
    format!("{}.{}.svc.{}", desired.http_service.name, desired.namespace, cluster_domain)
}

pub fn slave_service_fqdn(desired: &DesiredState, cluster_domain: &str) -> String {
    format!("{}.{}.svc.{}", desired.slave_service.name, desired.namespace, cluster_domain)
}

/// Groovy scripts the operator applies to every instance, in application order.
pub fn base_payloads(desired: &DesiredState, cluster_domain: &str) -> Vec<Payload> {
    let mut payloads = vec![Payload::new(
        "1-basic-settings.groovy",
        format!(
            "import jenkins.model.Jenkins\n\
             import hudson.model.Node.Mode\n\n\
             def jenkins = Jenkins.instance\n\
             jenkins.setNumExecutors({})\n\
             jenkins.setMode(Mode.EXCLUSIVE)\n\
             jenkins.save()\n",
            DEFAULT_EXECUTORS
        ),
    )];
    if !desired.master.disable_csrf_protection {
        payloads.push(Payload::new(
            "2-enable-csrf.groovy",
            "import hudson.security.csrf.DefaultCrumbIssuer\n\
             import jenkins.model.Jenkins\n\n\
             def jenkins = Jenkins.instance\n\
             if (jenkins.getCrumbIssuer() == null) {\n\
             \x20   jenkins.setCrumbIssuer(new DefaultCrumbIssuer(true))\n\
             \x20   jenkins.save()\n\
             }\n",
        ));
    }
    payloads.push(Payload::new(
        "3-disable-usage-stats.groovy",
        "import jenkins.model.Jenkins\n\n\
         def jenkins = Jenkins.instance\n\
         if (jenkins.isUsageStatisticsCollected()) {\n\
         \x20   jenkins.setNoUsageStatistics(true)\n\
         \x20   jenkins.save()\n\
         }\n",
    ));
    payloads.push(Payload::new(
        "4-disable-insecure-features.groovy",
        "import jenkins.model.Jenkins\n\n\
         def jenkins = Jenkins.instance\n\
         def protocols = new HashSet<String>(jenkins.getAgentProtocols())\n\
         protocols.removeAll(['JNLP3-connect', 'JNLP2-connect', 'JNLP-connect', 'CLI-connect'])\n\
         jenkins.setAgentProtocols(protocols)\n\
         if (jenkins.getDescriptor('jenkins.CLI') != null) {\n\
         \x20   jenkins.getDescriptor('jenkins.CLI').get().setEnabled(false)\n\
         }\n\
         jenkins.save()\n",
    ));
    payloads.push(Payload::new(
        "5-configure-kubernetes-plugin.groovy",
        format!(
            "import jenkins.model.Jenkins\n\
             import org.csanchez.jenkins.plugins.kubernetes.KubernetesCloud\n\n\
             def jenkins = Jenkins.getInstance()\n\
             def kubernetes = jenkins.clouds.getByName('kubernetes')\n\
             def add = kubernetes == null\n\
             if (add) {{\n\
             \x20   kubernetes = new KubernetesCloud('kubernetes')\n\
             }}\n\
             kubernetes.setServerUrl('https://kubernetes.default.svc.{domain}:443')\n\
             kubernetes.setNamespace('{ns}')\n\
             kubernetes.setJenkinsUrl('http://{http}:{http_port}')\n\
             kubernetes.setJenkinsTunnel('{slave}:{slave_port}')\n\
             kubernetes.setRetentionTimeout(15)\n\
             if (add) {{\n\
             \x20   jenkins.clouds.add(kubernetes)\n\
             }}\n\
             jenkins.save()\n",
            domain = cluster_domain,
            ns = desired.namespace,
            http = http_service_fqdn(desired, cluster_domain),
            http_port = desired.http_service.port,
            slave = slave_service_fqdn(desired, cluster_domain),
            slave_port = desired.slave_service.port,
        ),
    ));
    payloads.push(Payload::new(
        "6-configure-views.groovy",
        "import hudson.model.ListView\n\
         import jenkins.model.Jenkins\n\n\
         def jenkins = Jenkins.getInstance()\n\
         if (jenkins.getView('seed-jobs') == null) {\n\
         \x20   def view = new ListView('seed-jobs')\n\
         \x20   view.setIncludeRegex('.*-job-dsl-seed.*')\n\
         \x20   jenkins.addView(view)\n\
         }\n\
         if (jenkins.getView('non-seed-jobs') == null) {\n\
         \x20   def view = new ListView('non-seed-jobs')\n\
         \x20   view.setIncludeRegex('((?!seed)(?!jenkins).)*')\n\
         \x20   jenkins.addView(view)\n\
         }\n\
         jenkins.save()\n",
    ));
    payloads.push(Payload::new(
        "7-disable-job-dsl-script-approval.groovy",
        "import javaposse.jobdsl.plugin.GlobalJobDslSecurityConfiguration\n\
         import jenkins.model.GlobalConfiguration\n\n\
         def config = GlobalConfiguration.all().get(GlobalJobDslSecurityConfiguration.class)\n\
         config.useScriptSecurity = false\n\
         config.save()\n",
    ));
    payloads
}

pub fn base_configuration_config_map(desired: &DesiredState) -> ConfigMap {
    let data = desired.payloads.iter().map(|p| (p.name.clone(), p.content.clone())).collect();
    config_map(desired, labels::base_configuration_config_map_name(&desired.name), data)
}

pub fn service_account(desired: &DesiredState) -> ServiceAccount {
    ServiceAccount { metadata: meta(desired, desired.resource_name.clone()), ..Default::default() }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Lets the kubernetes plugin run agent pods in the namespace.
pub fn role(desired: &DesiredState) -> Role {
    Role {
        metadata: meta(desired, desired.resource_name.clone()),
        rules: Some(vec![
            rule(&["pods/portforward"], &["create"]),
            rule(&["pods"], &["create", "delete", "get", "list", "patch", "update", "watch"]),
            rule(&["pods/exec"], &["create", "delete", "get", "list", "patch", "update", "watch"]),
            rule(&["pods/log"], &["get", "list", "watch"]),
            rule(&["secrets"], &["get", "list", "watch"]),
            rule(&["configmaps"], &["get", "list", "watch"]),
        ]),
    }
}

/// Binding of `role_ref` to the instance service account.
pub fn role_binding(desired: &DesiredState, name: String, role_ref: RoleRef) -> RoleBinding {
    RoleBinding {
        metadata: meta(desired, name),
        role_ref,
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: desired.resource_name.clone(),
            namespace: Some(desired.namespace.clone()),
            ..Default::default()
        }]),
    }
}

pub fn base_role_binding(desired: &DesiredState) -> RoleBinding {
    let role_ref = RoleRef { api_group: labels::RBAC_API_GROUP.into(), kind: labels::ROLE_KIND.into(), name: desired.resource_name.clone() };
    role_binding(desired, desired.resource_name.clone(), role_ref)
}

/// Rewrite the operator-owned parts of a service; platform-assigned fields are kept.
pub fn apply_service(mut svc: Service, desired: &DesiredState, target: &ServiceTarget) -> Service {
    let meta = &mut svc.metadata;
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(desired.labels.clone());
    labels.extend(target.labels.clone());
    if !target.annotations.is_empty() {
        meta.annotations.get_or_insert_with(BTreeMap::new).extend(target.annotations.clone());
    }
    if meta.owner_references.as_ref().map_or(true, Vec::is_empty) {
        meta.owner_references = desired.owner_references();
    }
    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    // forced every cycle, a hand edit must not break routing
    spec.selector = Some(desired.labels.clone());
    spec.type_ = Some(target.type_.clone());
    let current = spec.ports.as_ref().and_then(|p| p.first()).cloned().unwrap_or_default();
    spec.ports = Some(vec![ServicePort {
        name: Some(target.port_name.clone()),
        port: target.port,
        target_port: Some(IntOrString::Int(target.target_port)),
        protocol: Some("TCP".into()),
        node_port: target.node_port.or(current.node_port),
        ..current
    }]);
    spec.load_balancer_ip = target.load_balancer_ip.clone();
    spec.load_balancer_source_ranges = (!target.load_balancer_source_ranges.is_empty()).then(|| target.load_balancer_source_ranges.clone());
    svc
}

pub fn service(desired: &DesiredState, target: &ServiceTarget) -> Service {
    apply_service(Service { metadata: meta(desired, target.name.clone()), ..Default::default() }, desired, target)
}

/// Point a route at the HTTP service; host and TLS chosen by the user survive.
pub fn apply_route(mut route: Route, desired: &DesiredState) -> Route {
    route.spec.to = RouteTarget { kind: "Service".into(), name: desired.http_service.name.clone() };
    route.spec.port = Some(RoutePort { target_port: IntOrString::Int(desired.http_service.target_port) });
    route
}

pub fn route(desired: &DesiredState) -> Route {
    let spec = RouteSpec {
        host: None,
        to: RouteTarget::default(),
        port: None,
        tls: Some(RouteTls { termination: "edge".into(), insecure_edge_termination_policy: Some("Redirect".into()) }),
    };
    let mut route = Route::new(&desired.http_service.name, spec);
    route.metadata = meta(desired, desired.http_service.name.clone());
    apply_route(route, desired)
}

fn volume(name: &str) -> Volume { Volume { name: name.into(), ..Default::default() } }

fn base_volumes(desired: &DesiredState) -> Vec<Volume> {
    vec![
        Volume { empty_dir: Some(EmptyDirVolumeSource::default()), ..volume("jenkins-home") },
        Volume {
            config_map: Some(ConfigMapVolumeSource {
                name: Some(labels::scripts_config_map_name(&desired.name)),
                default_mode: Some(0o777),
                ..Default::default()
            }),
            ..volume("scripts")
        },
        Volume {
            config_map: Some(ConfigMapVolumeSource { name: Some(labels::init_configuration_config_map_name(&desired.name)), ..Default::default() }),
            ..volume("init-configuration")
        },
        Volume {
            secret: Some(SecretVolumeSource { secret_name: Some(labels::credentials_secret_name(&desired.name)), ..Default::default() }),
            ..volume("operator-credentials")
        },
    ]
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount { name: name.into(), mount_path: path.into(), read_only: Some(read_only), ..Default::default() }
}

fn default_master_container() -> Container {
    Container {
        name: MASTER_CONTAINER.into(),
        image: Some(DEFAULT_IMAGE.into()),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction { path: Some("/login".into()), port: IntOrString::Int(labels::DEFAULT_HTTP_PORT), ..Default::default() }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Containers with the operator mounts added to the master (first) container.
fn containers(desired: &DesiredState) -> Vec<Container> {
    let mut containers = desired.master.containers.clone();
    if containers.is_empty() {
        containers.push(default_master_container());
    }
    let master = &mut containers[0];
    if master.command.is_none() {
        master.command = Some(vec!["bash".into(), "-c".into(), format!("{}/init.sh", SCRIPTS_PATH)]);
    }
    let env = master.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == "JENKINS_HOME") {
        env.push(EnvVar { name: "JENKINS_HOME".into(), value: Some(JENKINS_HOME.into()), ..Default::default() });
    }
    master.volume_mounts.get_or_insert_with(Vec::new).extend([
        mount("jenkins-home", JENKINS_HOME, false),
        mount("scripts", SCRIPTS_PATH, true),
        mount("init-configuration", INIT_CONFIGURATION_PATH, true),
        mount("operator-credentials", CREDENTIALS_PATH, true),
    ]);
    containers
}

/// Labels of the master pod: the owning set plus user labels.
pub fn pod_labels(desired: &DesiredState) -> BTreeMap<String, String> {
    let mut labels = desired.master.labels.clone();
    labels.extend(desired.labels.clone());
    labels
}

fn pod_spec(desired: &DesiredState, restart_policy: &str) -> PodSpec {
    let mut volumes = base_volumes(desired);
    volumes.extend(desired.master.volumes.iter().cloned());
    PodSpec {
        containers: containers(desired),
        volumes: Some(volumes),
        service_account_name: Some(desired.resource_name.clone()),
        node_selector: (!desired.master.node_selector.is_empty()).then(|| desired.master.node_selector.clone()),
        image_pull_secrets: (!desired.master.image_pull_secrets.is_empty()).then(|| desired.master.image_pull_secrets.clone()),
        priority_class_name: desired.master.priority_class_name.clone(),
        restart_policy: Some(restart_policy.into()),
        ..Default::default()
    }
}

pub fn master_pod(desired: &DesiredState) -> Pod {
    let mut metadata = meta(desired, desired.pod_name());
    metadata.labels = Some(pod_labels(desired));
    metadata.annotations = (!desired.master.annotations.is_empty()).then(|| desired.master.annotations.clone());
    Pod { metadata, spec: Some(pod_spec(desired, "Never")), ..Default::default() }
}

pub fn deployment(desired: &DesiredState) -> Deployment {
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(desired)),
            annotations: (!desired.master.annotations.is_empty()).then(|| desired.master.annotations.clone()),
            ..Default::default()
        }),
        spec: Some(pod_spec(desired, "Always")),
    };
    Deployment {
        metadata: meta(desired, desired.resource_name.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(desired.labels.clone()), ..Default::default() },
            strategy: Some(DeploymentStrategy { type_: Some("Recreate".into()), ..Default::default() }),
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::{Jenkins, Plugin};

    fn desired() -> DesiredState {
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        j.spec.master.plugins = vec![Plugin::new("git", "4.0.0")];
        j.spec.master.labels = BTreeMap::from([("team".to_string(), "qa".to_string())]);
        let d = DesiredState::from_jenkins(&j).unwrap();
        let payloads = base_payloads(&d, "cluster.local");
        d.with_payloads(payloads)
    }

    #[test]
    fn base_payloads_follow_csrf_switch() {
        let d = desired();
        assert_eq!(d.payloads.len(), 7);
        assert!(d.payloads.iter().all(|p| p.name.ends_with(".groovy")));
        let k8s = d.payloads.iter().find(|p| p.name.starts_with("5-")).unwrap();
        assert!(k8s.content.contains("http://jenkins-operator-http-ci.build.svc.cluster.local:8080"));
        let mut no_csrf = d.clone();
        no_csrf.master.disable_csrf_protection = true;
        assert_eq!(base_payloads(&no_csrf, "cluster.local").len(), 6);
    }

    #[test]
    fn service_selector_is_forced_back() {
        let d = desired();
        let mut svc = service(&d, &d.http_service);
        svc.spec.as_mut().unwrap().selector = Some(BTreeMap::from([("app".to_string(), "hijacked".to_string())]));
        svc.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".into());
        let fixed = apply_service(svc, &d, &d.http_service);
        let spec = fixed.spec.unwrap();
        assert_eq!(spec.selector.unwrap(), d.labels);
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(spec.ports.unwrap()[0].port, 8080);
    }

    #[test]
    fn pod_carries_owner_labels_and_operator_mounts() {
        let d = desired();
        let pod = master_pod(&d);
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("qa"));
        assert_eq!(labels.get(labels::LABEL_INSTANCE_KEY).map(String::as_str), Some("ci"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers[0].image.as_deref(), Some(DEFAULT_IMAGE));
        assert_eq!(spec.containers[0].volume_mounts.as_ref().unwrap().len(), 4);
        assert_eq!(spec.service_account_name.as_deref(), Some("jenkins-operator-ci"));
    }

    #[test]
    fn scripts_install_desired_plugins() {
        let cm = scripts_config_map(&desired());
        assert!(cm.data.unwrap()["init.sh"].contains("--plugins git:4.0.0"));
    }

    #[test]
    fn route_targets_http_service() {
        let r = route(&desired());
        assert_eq!(r.spec.to.name, "jenkins-operator-http-ci");
        assert_eq!(r.spec.port.unwrap().target_port, IntOrString::Int(8080));
    }
}
