pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod grpc;
pub mod peer;
pub mod registry;
pub mod shutdown;
pub mod task;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("taskgrid");
}
