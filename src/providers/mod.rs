pub mod finam;
