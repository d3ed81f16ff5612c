use super::*;
use tokio::sync::mpsc;

struct Fixture {
    ctx: ApiContext,
    patient: Identity,
    doctor: Identity,
    outsider: Identity,
}

async fn setup() -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let patient = storage
        .create_user("p@example.com", "Patient P", Role::Patient, None)
        .await
        .expect("patient");
    let doctor = storage
        .create_user("d@example.com", "Doctor D", Role::Doctor, None)
        .await
        .expect("doctor");
    let outsider = storage
        .create_user("u@example.com", "User U", Role::Patient, None)
        .await
        .expect("outsider");
    Fixture {
        ctx: ApiContext {
            storage,
            hub: LiveHub::new(),
            auth: AuthConfig {
                jwt_secret: "s".into(),
                ttl_seconds: 60,
            },
        },
        patient: Identity {
            user_id: patient,
            role: Role::Patient,
        },
        doctor: Identity {
            user_id: doctor,
            role: Role::Doctor,
        },
        outsider: Identity {
            user_id: outsider,
            role: Role::Patient,
        },
    }
}

fn asking_for_doctor(doctor: UserId) -> CreateConversationRequest {
    CreateConversationRequest {
        doctor_id: Some(doctor),
        patient_id: None,
    }
}

#[tokio::test]
async fn patient_and_doctor_resolve_to_same_conversation() {
    let f = setup().await;
    let (from_patient, created) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("patient create");
    assert!(created);
    assert_eq!(from_patient.patient_id, f.patient.user_id);
    assert_eq!(from_patient.doctor_id, f.doctor.user_id);

    let (from_doctor, created) = create_conversation(
        &f.ctx,
        f.doctor,
        &CreateConversationRequest {
            doctor_id: None,
            patient_id: Some(f.patient.user_id),
        },
    )
    .await
    .expect("doctor create");
    assert!(!created);
    assert_eq!(from_doctor.id, from_patient.id);
}

#[tokio::test]
async fn create_rejects_wrong_counterpart_role_and_unknown_user() {
    let f = setup().await;
    let err = create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.outsider.user_id))
        .await
        .expect_err("patient as doctor");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = create_conversation(&f.ctx, f.patient, &asking_for_doctor(UserId(9999)))
        .await
        .expect_err("unknown doctor");
    assert_eq!(err.code, ErrorCode::NotFound);

    let company = Identity {
        user_id: UserId(77),
        role: Role::MedicineCompany,
    };
    let err = create_conversation(&f.ctx, company, &asking_for_doctor(f.doctor.user_id))
        .await
        .expect_err("company");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn appended_messages_list_in_order() {
    let f = setup().await;
    let (conversation, _) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("create");

    let mut sent = Vec::new();
    for i in 0..6 {
        let sender = if i % 2 == 0 { f.patient } else { f.doctor };
        let message = append_and_broadcast(
            &f.ctx,
            conversation.id,
            sender.user_id,
            Some(&format!("note {i}")),
        )
        .await
        .expect("append");
        assert_eq!(message.sender.id, sender.user_id);
        sent.push(message.id);
    }

    let listed = list_messages(&f.ctx, f.doctor.user_id, conversation.id)
        .await
        .expect("list");
    assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), sent);
    assert_eq!(listed[1].sender.full_name, "Doctor D");
    assert_eq!(listed[1].sender.role, Role::Doctor);
}

#[tokio::test]
async fn empty_content_is_rejected_and_nothing_is_stored() {
    let f = setup().await;
    let (conversation, _) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("create");

    for content in [None, Some(""), Some("  \n ")] {
        let err = append_and_broadcast(&f.ctx, conversation.id, f.patient.user_id, content)
            .await
            .expect_err("empty content");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    let listed = list_messages(&f.ctx, f.patient.user_id, conversation.id)
        .await
        .expect("list");
    assert!(listed.is_empty());
}

#[tokio::test]
async fn outsider_is_denied_read_and_write_and_nothing_is_broadcast() {
    let f = setup().await;
    let (conversation, _) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = f.ctx.hub.connect(tx);
    f.ctx.hub.join(listener, conversation.id);

    let err = append_and_broadcast(&f.ctx, conversation.id, f.outsider.user_id, Some("hi"))
        .await
        .expect_err("outsider write");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = list_messages(&f.ctx, f.outsider.user_id, conversation.id)
        .await
        .expect_err("outsider read");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = get_conversation(&f.ctx, f.outsider.user_id, conversation.id)
        .await
        .expect_err("outsider get");
    assert_eq!(err.code, ErrorCode::Forbidden);

    assert!(rx.try_recv().is_err());
    let listed = list_messages(&f.ctx, f.patient.user_id, conversation.id)
        .await
        .expect("list");
    assert!(listed.is_empty());
}

#[tokio::test]
async fn unknown_conversation_is_not_found() {
    let f = setup().await;
    let err = append_and_broadcast(&f.ctx, ConversationId(404), f.patient.user_id, Some("hi"))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = list_messages(&f.ctx, f.patient.user_id, ConversationId(404))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn append_broadcasts_to_joined_connections() {
    let f = setup().await;
    let (conversation, _) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("create");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = f.ctx.hub.connect(tx);
    join_conversation(&f.ctx, f.doctor.user_id, connection, conversation.id)
        .await
        .expect("join");

    let message = append_and_broadcast(&f.ctx, conversation.id, f.patient.user_id, Some("hello"))
        .await
        .expect("append");

    match rx.try_recv().expect("pushed") {
        ServerEvent::NewMessage { message: pushed } => assert_eq!(pushed, message),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn list_conversations_is_most_recent_first_with_counterpart_fields() {
    let f = setup().await;
    let second_doctor = f
        .ctx
        .storage
        .create_user("d2@example.com", "Doctor Two", Role::Doctor, None)
        .await
        .expect("doctor");

    let (first, _) = create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
        .await
        .expect("first");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (second, _) = create_conversation(&f.ctx, f.patient, &asking_for_doctor(second_doctor))
        .await
        .expect("second");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    append_and_broadcast(&f.ctx, first.id, f.patient.user_id, Some("bump"))
        .await
        .expect("append");

    let listed = list_conversations(&f.ctx, f.patient).await.expect("list");
    assert_eq!(
        listed.iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
    assert_eq!(listed[0].doctor.full_name, "Doctor D");
    assert_eq!(listed[0].patient.email, "p@example.com");

    let for_doctor = list_conversations(&f.ctx, f.doctor).await.expect("list");
    assert_eq!(for_doctor.len(), 1);
}

#[tokio::test]
async fn typing_requires_membership() {
    let f = setup().await;
    let (conversation, _) =
        create_conversation(&f.ctx, f.patient, &asking_for_doctor(f.doctor.user_id))
            .await
            .expect("create");
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection = f.ctx.hub.connect(tx);

    let err = relay_typing(&f.ctx, connection, f.patient.user_id, conversation.id, true)
        .expect_err("not joined");
    assert_eq!(err.code, ErrorCode::Forbidden);

    join_conversation(&f.ctx, f.patient.user_id, connection, conversation.id)
        .await
        .expect("join");
    let delivered = relay_typing(&f.ctx, connection, f.patient.user_id, conversation.id, true)
        .expect("relay");
    assert_eq!(delivered, 0);
}
