// cl-test-utils: Shared test utilities for the control-plane suite.
//
// Provides a mock cloud provider API, mock control-channel peers for both
// sides of the protocol, and rcgen-backed throwaway certificates.

pub mod certs;
pub mod mock_cloud;
pub mod mock_control;
pub mod mock_device;

pub use certs::{device_cert, server_cert, TestCert};
pub use mock_cloud::MockCloudApi;
pub use mock_control::MockControlServer;
pub use mock_device::MockDevice;
