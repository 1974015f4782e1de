use groupkind_controller::crd::App;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&App::crd())?);
    Ok(())
}
