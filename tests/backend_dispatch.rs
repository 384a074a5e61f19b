use briny_conv::prelude::*;

#[test]
fn every_backend_produces_the_same_result() {
    let x = Tensor::from_vec(vec![1, 1, 4, 4], (0..16).map(|v| v as f32).collect::<Vec<_>>());
    let w = Tensor::from_vec(vec![2, 1, 2, 2], vec![1.0f32, 0.0, 0.0, 1.0, 0.25, 0.25, 0.25, 0.25]);
    let params = ConvParams::new(2).stride([2, 2]);
    let expected = vec![5.0, 9.0, 21.0, 25.0, 2.5, 4.5, 10.5, 12.5];

    for backend in [Backend::Cpu, Backend::Wgpu] {
        set_backend(backend);
        let y = convolution(&x, &w, &params, &ConvOptions::default()).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2, 2]);
        let got = y.to_vec_f64();
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-5, "{backend:?}: {got:?}");
        }
    }
    set_backend(Backend::Cpu);
}
