use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&sonarr_operator::resources::sonarrs::Sonarr::crd()).unwrap()
    )
}
