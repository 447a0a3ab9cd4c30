// tunnel-test-utils: mock origin servers for the tunnel test suites.
//
// Each mock binds 127.0.0.1:0 and exposes the real port; every test spins
// up its own isolated instance, and the background tasks die with the
// handle.

mod grpc_origin;
mod mock_origin;

pub use grpc_origin::MockGrpcOrigin;
pub use mock_origin::MockOrigin;
