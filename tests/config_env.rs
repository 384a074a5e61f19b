use briny_conv::backend::{Backend, get_backend, set_backend};
use briny_conv::config::{ConvOptions, load_from};
use std::collections::HashMap;

// One test per binary: the switches are process-wide.
#[test]
fn environment_overrides_global_switches() {
    let env: HashMap<&str, &str> = [
        ("BRINY_CONV_DETERMINISTIC", "yes"),
        ("BRINY_CONV_ALLOW_TF32", "0"),
        ("BRINY_CONV_BENCHMARK", "sometimes"),
        ("BRINY_CONV_BACKEND", "GPU"),
    ]
    .into_iter()
    .collect();
    load_from(|name| env.get(name).map(|v| (*v).to_string()));

    let options = ConvOptions::from_globals();
    assert!(options.deterministic);
    assert!(!options.allow_tf32);
    assert!(!options.benchmark, "unparseable values leave the default");
    assert_eq!(get_backend(), Backend::Wgpu);

    load_from(|name| (name == "BRINY_CONV_BACKEND").then(|| "tpu".to_string()));
    assert_eq!(get_backend(), Backend::Wgpu);

    set_backend(Backend::Cpu);
    load_from(|_| None);
    assert_eq!(get_backend(), Backend::Cpu);
    assert!(ConvOptions::from_globals().deterministic);
}
