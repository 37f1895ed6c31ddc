use std::path::Path;
use std::thread;

use float_cmp::assert_approx_eq;
use num_complex::Complex64;
use tempfile::tempdir;

use dmps::comm::{
    broadcast_serializing, master_broadcast_order, recv_value, ChannelTransport, Order,
    MASTER_RANK,
};
use dmps::io::{self, mps_ten_path};
use dmps::lanczos::LanczosParams;
use dmps::measure::{measure_one_site_op, one_site_op};
use dmps::mpo::Mpo;
use dmps::mps::{occupation_phys_index, FiniteMps};
use dmps::sweep::{
    master_two_site_finite_vmps, slave_two_site_finite_vmps, SweepParams,
};
use dmps::tdvp::{
    master_two_site_finite_tdvp, slave_two_site_finite_tdvp, TdvpParams,
};
use dmps::types::Scalar;

/// Ground energy of the 6-site open free-fermion chain at `t = 1`, half
/// filling: the sum of the three negative single-particle energies
/// `-2 cos(kπ/7)`.
const E0_CHAIN6: f64 = -3.4939592074349334893668128643185;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn chain_params(dir: &Path, sweeps: usize) -> SweepParams {
    SweepParams::new(
        sweeps,
        2,
        16,
        1e-16,
        LanczosParams::new(1e-15, 100),
        dir.join("mps"),
        dir.join("temp"),
    )
}

fn write_product_state<S: Scalar>(dir: &Path, occs: &[usize]) {
    let mps_path = dir.join("mps");
    io::create_path(&mps_path).unwrap();
    let phys = occupation_phys_index();
    let mut mps = FiniteMps::<S>::product_state(&phys, occs);
    mps.dump_all(&mps_path).unwrap();
}

fn load_full_mps<S: Scalar>(dir: &Path, n: usize) -> FiniteMps<S> {
    let mps_path = dir.join("mps");
    let mut mps = FiniteMps::<S>::new(n);
    for i in 0..n {
        mps.load_ten(i, &mps_ten_path(&mps_path, i)).unwrap();
    }
    mps
}

#[test]
fn test_vmps_free_fermion_chain_serial() {
    init_logging();
    let dir = tempdir().unwrap();
    write_product_state::<f64>(dir.path(), &[1, 1, 0, 1, 0, 0]);
    let params = chain_params(dir.path(), 8).with_noises(vec![1e-3, 1e-5, 0.0]);
    let mpo = Mpo::<f64>::spinless_fermion_chain(6, 1.0);

    let tp = ChannelTransport::mesh(1).remove(0);
    let mut mps = FiniteMps::<f64>::new(6);
    let e0 = master_two_site_finite_vmps(&mut mps, &mpo, &params, &tp).unwrap();
    assert_approx_eq!(f64, e0, E0_CHAIN6, epsilon = 1e-13);

    // the converged state is normalized and sits at half filling
    let mut full = load_full_mps::<f64>(dir.path(), 6);
    let norm = full.to_full_tensor().norm();
    assert_approx_eq!(f64, norm, 1.0, epsilon = 1e-10);
    let number = one_site_op(&occupation_phys_index(), &[(1, 1, 1.0)]);
    let total: f64 = measure_one_site_op(&mut full, &number).iter().sum();
    assert_approx_eq!(f64, total, 3.0, epsilon = 1e-10);
}

#[test]
fn test_vmps_distributed_matches_serial() {
    init_logging();
    let serial_dir = tempdir().unwrap();
    write_product_state::<f64>(serial_dir.path(), &[1, 1, 0, 1, 0, 0]);
    let params = chain_params(serial_dir.path(), 6);
    let mpo = Mpo::<f64>::spinless_fermion_chain(6, 1.0);
    let tp = ChannelTransport::mesh(1).remove(0);
    let mut mps = FiniteMps::<f64>::new(6);
    let serial_e0 = master_two_site_finite_vmps(&mut mps, &mpo, &params, &tp).unwrap();

    let dist_dir = tempdir().unwrap();
    write_product_state::<f64>(dist_dir.path(), &[1, 1, 0, 1, 0, 0]);
    let params = chain_params(dist_dir.path(), 6);
    let mut mesh = ChannelTransport::mesh(3);
    let master = mesh.remove(0);
    let mut handles = Vec::new();
    for slave in mesh {
        let mpo = mpo.clone();
        handles.push(thread::spawn(move || {
            slave_two_site_finite_vmps(&mpo, &slave);
        }));
    }
    let mut mps = FiniteMps::<f64>::new(6);
    let dist_e0 = master_two_site_finite_vmps(&mut mps, &mpo, &params, &master).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_approx_eq!(f64, dist_e0, serial_e0, epsilon = 1e-12);
    assert_approx_eq!(f64, dist_e0, E0_CHAIN6, epsilon = 1e-12);
}

#[test]
fn test_vmps_distributed_with_noise_converges() {
    init_logging();
    let dir = tempdir().unwrap();
    write_product_state::<f64>(dir.path(), &[1, 1, 0, 1, 0, 0]);
    let params = chain_params(dir.path(), 8).with_noises(vec![1e-2, 1e-4, 0.0]);
    let mpo = Mpo::<f64>::spinless_fermion_chain(6, 1.0);

    let mut mesh = ChannelTransport::mesh(4);
    let master = mesh.remove(0);
    let mut handles = Vec::new();
    for slave in mesh {
        let mpo = mpo.clone();
        handles.push(thread::spawn(move || {
            slave_two_site_finite_vmps(&mpo, &slave);
        }));
    }
    let mut mps = FiniteMps::<f64>::new(6);
    let e0 = master_two_site_finite_vmps(&mut mps, &mpo, &params, &master).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_approx_eq!(f64, e0, E0_CHAIN6, epsilon = 1e-13);
}

#[test]
fn test_vmps_energy_is_monotone_without_noise() {
    init_logging();
    let dir = tempdir().unwrap();
    write_product_state::<f64>(dir.path(), &[1, 1, 0, 1, 0, 0]);
    let mpo = Mpo::<f64>::spinless_fermion_chain(6, 1.0);
    let tp = ChannelTransport::mesh(1).remove(0);

    // one-sweep programs back to back; the environment cache and boundary
    // determination carry over between runs
    let mut energies = Vec::new();
    for _ in 0..5 {
        let params = chain_params(dir.path(), 1);
        let mut mps = FiniteMps::<f64>::new(6);
        energies.push(master_two_site_finite_vmps(&mut mps, &mpo, &params, &tp).unwrap());
    }
    for pair in energies.windows(2) {
        assert!(
            pair[1] <= pair[0] + 1e-12,
            "energy rose across sweeps: {energies:?}"
        );
    }
    assert_approx_eq!(f64, *energies.last().unwrap(), E0_CHAIN6, epsilon = 1e-12);
}

#[test]
fn test_order_protocol_liveness() {
    init_logging();
    // every slave terminates once ProgramFinal arrives, regardless of the
    // valid (or unknown) orders broadcast before it
    let mpo = Mpo::<f64>::spinless_fermion_chain(4, 1.0);
    let mut mesh = ChannelTransport::mesh(4);
    let master = mesh.remove(0);
    let mut handles = Vec::new();
    for slave in mesh {
        let mpo = mpo.clone();
        handles.push(thread::spawn(move || {
            slave_two_site_finite_vmps(&mpo, &slave);
        }));
    }

    master_broadcast_order(&master, Order::ProgramStart);
    for w in 1..4 {
        let r: usize = recv_value(&master, w, 2 * w);
        assert_eq!(r, w);
    }
    master_broadcast_order(&master, Order::InitGrowEnv);
    master_broadcast_order(&master, Order::InitGrowEnvFinish);
    // an unknown order code is reported and ignored by every slave
    broadcast_serializing(&master, MASTER_RANK, 999u32);
    master_broadcast_order(&master, Order::ProgramFinal);

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_tdvp_conserves_norm_and_charge() {
    init_logging();
    let dir = tempdir().unwrap();
    write_product_state::<Complex64>(dir.path(), &[1, 1, 0, 1, 0, 0]);
    let sweep = SweepParams::new(
        4,
        2,
        16,
        1e-14,
        LanczosParams::new(1e-14, 60),
        dir.path().join("mps"),
        dir.path().join("temp"),
    );
    let params = TdvpParams { sweep, tau: 0.02 };
    let mpo = Mpo::<Complex64>::spinless_fermion_chain(6, 1.0);

    let mut mesh = ChannelTransport::mesh(2);
    let master = mesh.remove(0);
    let slave_mpo = mpo.clone();
    let slave = mesh.remove(0);
    let handle = thread::spawn(move || {
        slave_two_site_finite_tdvp(&slave_mpo, &slave);
    });
    let mut mps = FiniteMps::<Complex64>::new(6);
    master_two_site_finite_tdvp(&mut mps, &mpo, &params, &master).unwrap();
    handle.join().unwrap();

    let mut full = load_full_mps::<Complex64>(dir.path(), 6);
    let norm = full.to_full_tensor().norm();
    assert_approx_eq!(f64, norm, 1.0, epsilon = 1e-8);

    let number = one_site_op(
        &occupation_phys_index(),
        &[(1, 1, Complex64::new(1.0, 0.0))],
    );
    let occupations = measure_one_site_op(&mut full, &number);
    let total: f64 = occupations.iter().map(|v| v.re).sum();
    assert_approx_eq!(f64, total, 3.0, epsilon = 1e-8);
    // real time evolution actually moved the particles
    assert!(
        (occupations[2].re - 0.0).abs() > 1e-4,
        "site 2 occupation unchanged: {occupations:?}"
    );
}

#[test]
fn test_env_cache_self_heals_between_runs() {
    init_logging();
    let dir = tempdir().unwrap();
    write_product_state::<f64>(dir.path(), &[1, 1, 0, 1, 0, 0]);
    let mpo = Mpo::<f64>::spinless_fermion_chain(6, 1.0);
    let tp = ChannelTransport::mesh(1).remove(0);

    let params = chain_params(dir.path(), 2);
    let mut mps = FiniteMps::<f64>::new(6);
    master_two_site_finite_vmps(&mut mps, &mpo, &params, &tp).unwrap();

    // wipe the environment cache; the next program must regenerate it
    std::fs::remove_dir_all(dir.path().join("temp")).unwrap();
    let params = chain_params(dir.path(), 2);
    let mut mps = FiniteMps::<f64>::new(6);
    let e0 = master_two_site_finite_vmps(&mut mps, &mpo, &params, &tp).unwrap();
    assert_approx_eq!(f64, e0, E0_CHAIN6, epsilon = 1e-12);
}
