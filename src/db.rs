pub mod prod_db;
pub mod sedlabanki;
