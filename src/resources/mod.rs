pub mod sonarrs;
