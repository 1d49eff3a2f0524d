pub mod evaluate;
pub mod grid;
pub mod organize;
pub mod preprocess;
pub mod restore;
pub mod sections;
pub mod status;
pub mod verify;
