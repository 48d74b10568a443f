pub mod ingest;
pub mod model;
pub mod normalize;
pub mod tz;
pub mod upstream;
pub mod window;
