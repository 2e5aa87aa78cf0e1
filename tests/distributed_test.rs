//! Multi-process halo exchange tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use std::sync::Arc;

use mpi::traits::*;

use gridhalo::exchange::{
    dims_create, ChannelConfig, ExchangeEngine, FieldSet, MpiTransport, Protocol,
    VariableSelection,
};
use gridhalo::pattern::GlobalPattern;
use gridhalo::{Field4, SubdomainLayout};

#[test]
fn distributed_exchange_matches_global_pattern() {
    let universe = mpi::initialize().expect("MPI init failed");
    let world = universe.world();
    let size = world.size() as usize;

    let dims = dims_create(size, 2).expect("dims_create failed");
    // Reordering lets the Cartesian ranks differ from the world ranks.
    let cart = world
        .create_cartesian_communicator(
            &[dims[0] as i32, dims[1] as i32],
            &[true, true],
            true,
        )
        .expect("cartesian communicator failed");
    let transport = MpiTransport::new(cart).expect("MPI transport failed");
    let topology = transport.topology().expect("topology failed");

    let global = [8 * dims[0], 6 * dims[1], 1];
    let (layout, start) =
        SubdomainLayout::decompose(2, 2, global, &topology).expect("decompose failed");
    let mut engine = ExchangeEngine::new(Arc::new(transport), topology).expect("engine failed");

    for protocol in [Protocol::Blocking, Protocol::NonBlocking, Protocol::Persistent] {
        let variables = VariableSelection::all(3, true).expect("selection failed");
        let mut channel = engine
            .create_channel(&ChannelConfig::new(layout, variables).with_protocol(protocol))
            .expect("channel failed");

        let pattern = GlobalPattern::new(layout, start, global, [true; 3]);
        let mut cell = Field4::cell_centered(&layout, 3);
        let mut faces = Field4::staggered(&layout);
        pattern.init_cells(&mut cell);
        pattern.init_faces(&mut faces);

        // Several rounds restart the same persistent registrations.
        for _ in 0..3 {
            let mut fields = FieldSet {
                cell: &mut cell,
                staggered: Some(&mut faces),
            };
            channel.exchange_all(&mut fields).expect("exchange failed");
        }
        channel.destroy().expect("destroy failed");

        assert!(pattern.check_cells(&cell, &[0, 1, 2]).is_empty(), "{protocol}: cells");
        assert!(pattern.check_faces(&faces).is_empty(), "{protocol}: faces");
    }
}
