#[macro_use]
extern crate rocket;

#[launch]
fn rocket() -> _ {
    let rocket = table_loader::rocket();
    log::info!("starting table loader API server");
    rocket
}
